// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

//! Coordinator and agents wired together over a lossy in-memory bus.

#![allow(dead_code)]

use busupdate_agent::mem_flash::MemFlash;
use busupdate_agent::{AgentAction, AgentConfig, FirmwareRegion, TargetAgent};
use busupdate_host_core::{Coordinator, CoordinatorConfig, MemoryStore, SessionInfo, SessionState};
use busupdate_messages::footer::{IMAGE_FOOTER_LEN, IMAGE_INFO_OFFSET};
use busupdate_messages::{CrcCoverage, ImageCrc, ImageFooter, UpdateMessage};
use embassy_time::Instant;

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FIRMWARE_SIZE: u32 = 0x1_0000;
pub const BLOB_ADDRESS: u32 = FLASH_BASE + FIRMWARE_SIZE;
pub const FLASH_SIZE: usize = 0x2_0000;
pub const TICK_MS: u64 = 10;

pub type Agent = TargetAgent<MemFlash<'static, 4096, 1>>;

pub fn agent(address: u8) -> Agent {
    let mem: &'static mut [u8] = Box::leak(vec![0u8; FLASH_SIZE].into_boxed_slice());
    let region = FirmwareRegion { address: FLASH_BASE, size: FIRMWARE_SIZE };
    TargetAgent::new(AgentConfig::new(address, FLASH_BASE, region), MemFlash::erased(mem))
}

/// Firmware image of `len` bytes with its footer in place. `crc_error` is XORed into the
/// footer CRC.
pub fn firmware_image(len: usize, version: u32, crc_error: u32) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
    let footer = ImageFooter {
        size: len as u32,
        crc32: ImageCrc::checksum(CrcCoverage::Firmware, &image) ^ crc_error,
        version,
        write_addr: FLASH_BASE,
        load_addr: FLASH_BASE,
    };
    let at = IMAGE_INFO_OFFSET as usize;
    image[at..at + IMAGE_FOOTER_LEN].copy_from_slice(&footer.to_bytes());
    image
}

pub fn blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// Offset of a bus address within an agent's flash.
pub fn flash_offset(address: u32) -> usize {
    (address - FLASH_BASE) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Reply,
}

pub type LossModel = Box<dyn FnMut(Direction, &UpdateMessage<'_>) -> bool>;

pub struct Bench {
    pub coordinator: Coordinator<MemoryStore>,
    pub agents: Vec<Agent>,
    pub now_ms: u64,
    /// Every request the coordinator put on the bus, lost or not
    pub requests: Vec<Vec<u8>>,
    /// Addresses of agents that asked for a reset
    pub resets: Vec<u8>,
    /// Sessions as seen in their terminal state
    pub finished: Vec<SessionInfo>,
    /// Returns true to lose a message in transit
    pub lose: LossModel,
}

impl Bench {
    pub fn new(store: MemoryStore, config: CoordinatorConfig, agents: Vec<Agent>) -> Self {
        Self {
            coordinator: Coordinator::new(store, config),
            agents,
            now_ms: 0,
            requests: Vec::new(),
            resets: Vec::new(),
            finished: Vec::new(),
            lose: Box::new(|_: Direction, _: &UpdateMessage<'_>| false),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::from_millis(self.now_ms)
    }

    pub fn step(&mut self) {
        let now = self.now();

        for outbound in self.coordinator.service(now) {
            self.requests.push(outbound.payload.to_vec());
            let request = UpdateMessage::decode(&outbound.payload).unwrap();
            if (self.lose)(Direction::Request, &request) {
                continue;
            }

            for agent in self.agents.iter_mut() {
                let output = agent.process_message(now, &outbound.payload);
                if let Some(AgentAction::ResetDevice { .. }) = output.action {
                    self.resets.push(agent.config().node_address);
                }
                if let Some(reply) = output.reply {
                    if (self.lose)(Direction::Reply, &reply) {
                        continue;
                    }
                    self.coordinator.process_response(now, &reply.to_vec().unwrap());
                }
            }
        }

        for agent in self.agents.iter_mut() {
            agent.service(now);
        }

        for index in 0..busupdate_host_core::DEFAULT_MAX_SESSIONS {
            if let Some(info) = self.coordinator.get_session_info(index) {
                if matches!(info.state, SessionState::CompletedOk | SessionState::Failed) {
                    self.finished.push(info);
                }
            }
        }

        self.now_ms += TICK_MS;
    }

    /// Step until no session is left, panicking after `max_steps`.
    pub fn run_to_completion(&mut self, max_steps: usize) {
        for _ in 0..max_steps {
            self.step();
            if self.coordinator.active_sessions() == 0 {
                return;
            }
        }
        panic!("sessions still active after {max_steps} steps");
    }

    pub fn run_for(&mut self, millis: u64) {
        let until = self.now_ms + millis;
        while self.now_ms < until {
            self.step();
        }
    }

    pub fn sent(&self) -> Vec<UpdateMessage<'_>> {
        self.requests
            .iter()
            .map(|payload| UpdateMessage::decode(payload).unwrap())
            .collect()
    }

    /// `(sequence, chunk length)` of every DATA_PACKET sent to `target`.
    pub fn data_packets(&self, target: u8) -> Vec<(u32, usize)> {
        self.sent()
            .into_iter()
            .filter_map(|message| match message {
                UpdateMessage::DataPacket { target: t, sequence, chunk } if t == target => {
                    Some((sequence, chunk.len()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn count_sent(&self, predicate: impl Fn(&UpdateMessage<'_>) -> bool) -> usize {
        self.sent().iter().filter(|message| predicate(*message)).count()
    }

    pub fn agent(&self, address: u8) -> &Agent {
        self.agents
            .iter()
            .find(|agent| agent.config().node_address == address)
            .unwrap()
    }

    pub fn agent_flash(&self, address: u8) -> &[u8] {
        self.agent(address).flash().inner().contents()
    }
}
