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

//! Coordinator and agent in one process, joined by a loopback bus that can lose replies.

use crate::util::{self, CommandLine};
use busupdate_agent::mem_flash::MemFlash;
use busupdate_agent::{AgentAction, AgentConfig, FirmwareRegion, TargetAgent};
use busupdate_host_core::source::{FIRST_RAW_SLOT, FW_SLOT_SIZE};
use busupdate_host_core::{
    Coordinator, CoordinatorConfig, MemoryStore, NackReason, QueueTransport, SlotStore, SourceKind, SourceStore,
    pump,
};
use busupdate_messages::footer::RAW_BLOB_DATA_OFFSET;
use busupdate_messages::{FIRMWARE_UPDATE_MSG_TYPE, RawBlobFooter};
use embassy_time::{Duration, Instant};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;

const FLASH_BASE: u32 = 0x0800_0000;
const FIRMWARE_REGION_SIZE: u32 = FW_SLOT_SIZE;
const NODE_FLASH_SIZE: usize = 2 * FW_SLOT_SIZE as usize;
const STAGING_FLASH_SIZE: usize = (FIRST_RAW_SLOT + 1) * FW_SLOT_SIZE as usize;
const TICK: Duration = Duration::from_millis(10);
const TIME_LIMIT: Duration = Duration::from_millis(30 * 60 * 1000);

type SimFlash<'a> = MemFlash<'a, 4096, 1>;
type SimAgent<'a> = TargetAgent<SimFlash<'a>>;

#[derive(Debug, Default)]
pub(crate) struct SimulationReport {
    pub requests: usize,
    pub replies: usize,
    pub dropped: usize,
    pub bytes_sent: u32,
    pub image_size: u32,
    pub reset_after: Option<Duration>,
    pub elapsed: Duration,
}

/// Lose every `drop_every`th agent reply. Zero keeps them all.
pub(crate) struct ReplyLoss {
    drop_every: usize,
    seen: usize,
}

impl ReplyLoss {
    pub fn new(drop_every: usize) -> Self {
        Self { drop_every, seen: 0 }
    }

    fn lose_next(&mut self) -> bool {
        self.seen += 1;
        self.drop_every > 0 && self.seen % self.drop_every == 0
    }
}

/// Run one session to its end over the loopback bus.
pub(crate) fn simulate<S: SourceStore>(
    store: S,
    name: &str,
    agent: &mut SimAgent<'_>,
    staging: u32,
    loss: &mut ReplyLoss,
) -> IoResult<(Result<(), NackReason>, SimulationReport)> {
    let address = agent.config().node_address;
    let mut coordinator: Coordinator<S, 1> = Coordinator::new(store, CoordinatorConfig::default());
    coordinator
        .start_session(address, name, staging)
        .map_err(|e| IoError::new(ErrorKind::InvalidInput, format!("Unable to start update: {:?}", e)))?;

    let mut transport = QueueTransport::new();
    let mut report = SimulationReport::default();
    let started = Instant::from_ticks(0);
    let mut now = started;

    loop {
        pump(&mut coordinator, &mut transport, now).unwrap_or_else(|never| match never {});

        for (msg_type, payload) in transport.take_sent() {
            if msg_type != FIRMWARE_UPDATE_MSG_TYPE {
                continue;
            }
            report.requests += 1;

            let output = agent.process_message(now, &payload);
            if let Some(AgentAction::ResetDevice { after }) = output.action {
                report.reset_after = Some(after);
            }
            let Some(reply) = output.reply else {
                continue;
            };
            report.replies += 1;
            if loss.lose_next() {
                report.dropped += 1;
                log::debug!("Losing {:?}", reply.sub_command());
                continue;
            }
            let encoded = reply
                .to_vec()
                .map_err(|e| IoError::new(ErrorKind::Other, format!("{:?}", e)))?;
            transport.deliver(FIRMWARE_UPDATE_MSG_TYPE, &encoded);
        }

        if agent.service(now) {
            log::warn!("Agent abandoned the transfer");
        }

        let info = coordinator
            .session_for(address)
            .and_then(|index| coordinator.get_session_info(index))
            .ok_or_else(|| IoError::new(ErrorKind::Other, "Session vanished before finishing"))?;
        if let Some(outcome) = info.outcome {
            report.bytes_sent = info.bytes_sent;
            report.image_size = info.image_size;
            report.elapsed = now.saturating_duration_since(started);
            return Ok((outcome, report));
        }

        now += TICK;
        if now.saturating_duration_since(started) > TIME_LIMIT {
            return Err(IoError::new(ErrorKind::TimedOut, "Simulation did not finish"));
        }
    }
}

pub(crate) fn run(command_line: &CommandLine) -> IoResult<()> {
    let path = command_line.input()?;
    let address = command_line.address()?;
    let drop_every = command_line.number("drop-every")?.unwrap_or(0) as usize;
    let data = util::read_binary_file(path)?;
    let name = util::file_name(Path::new(path))?;

    let mut node_flash = vec![0u8; NODE_FLASH_SIZE];
    let region = FirmwareRegion { address: FLASH_BASE, size: FIRMWARE_REGION_SIZE };
    let mut agent = SimAgent::new(AgentConfig::new(address, FLASH_BASE, region), SimFlash::erased(&mut node_flash));
    let mut loss = ReplyLoss::new(drop_every);

    let packed_blob = RawBlobFooter::from_bytes(&data).ok().filter(RawBlobFooter::is_valid);
    let (outcome, report, expected, staging) = match packed_blob {
        Some(footer) => {
            log::info!("{} is a packed blob holding '{}'", path, footer.filename());
            let staging = command_line.number("staging")?.unwrap_or(FLASH_BASE + FIRMWARE_REGION_SIZE);

            let mut staging_flash = vec![0u8; STAGING_FLASH_SIZE];
            let mut flash = SimFlash::erased(&mut staging_flash);
            let slot_offset = SlotStore::<SimFlash<'_>>::slot_address(FIRST_RAW_SLOT) as usize;
            let slot_len = data.len().min(FW_SLOT_SIZE as usize);
            flash.contents_mut()[slot_offset..slot_offset + slot_len].copy_from_slice(&data[..slot_len]);

            let slot_name = format!("slot{}", FIRST_RAW_SLOT);
            let (outcome, report) = simulate(SlotStore::new(flash), &slot_name, &mut agent, staging, &mut loss)?;
            let blob = data.get(RAW_BLOB_DATA_OFFSET as usize..).map(<[u8]>::to_vec).unwrap_or_default();
            (outcome, report, blob, staging)
        }
        None => {
            let default_staging = match SourceKind::from_name(name) {
                SourceKind::Firmware => FLASH_BASE,
                _ => FLASH_BASE + FIRMWARE_REGION_SIZE,
            };
            let staging = command_line.number("staging")?.unwrap_or(default_staging);

            let mut store = MemoryStore::new();
            store.insert(name, data.clone());
            let (outcome, report) = simulate(store, name, &mut agent, staging, &mut loss)?;
            (outcome, report, data, staging)
        }
    };

    log::info!(
        "{} requests, {} replies, {} lost, {} of {} bytes in {} ms of bus time",
        report.requests,
        report.replies,
        report.dropped,
        report.bytes_sent,
        report.image_size,
        report.elapsed.as_millis()
    );

    if let Err(reason) = outcome {
        return Err(IoError::new(ErrorKind::Other, reason.as_text()));
    }

    let staged = expected.get(..report.image_size as usize).unwrap_or(&expected);
    if !node_holds(&agent, staging, staged) {
        return Err(IoError::new(ErrorKind::InvalidData, "Node flash does not hold the image"));
    }
    match report.reset_after {
        Some(after) => log::info!("Node would reset after {} ms", after.as_millis()),
        None => log::info!("Blob stored, node stays up"),
    }
    Ok(())
}

/// True when the node's flash holds `expected` at bus address `address`.
fn node_holds(agent: &SimAgent<'_>, address: u32, expected: &[u8]) -> bool {
    let Some(offset) = address.checked_sub(FLASH_BASE) else {
        return false;
    };
    let offset = offset as usize;
    agent.flash().inner().contents().get(offset..offset + expected.len()) == Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_tools::{pack_blob, stamp_footer};

    const NODE: u8 = 3;

    fn node(mem: &mut [u8]) -> SimAgent<'_> {
        let region = FirmwareRegion { address: FLASH_BASE, size: FIRMWARE_REGION_SIZE };
        SimAgent::new(AgentConfig::new(NODE, FLASH_BASE, region), SimFlash::erased(mem))
    }

    #[test]
    fn firmware_survives_lost_replies() {
        let mut image: Vec<u8> = (0..0x3000).map(|i| (i % 211) as u8).collect();
        stamp_footer(&mut image, 2, FLASH_BASE, FLASH_BASE).unwrap();
        let mut store = MemoryStore::new();
        store.insert("node.bin", image.clone());

        let mut mem = vec![0u8; NODE_FLASH_SIZE];
        let mut agent = node(&mut mem);
        let (outcome, report) =
            simulate(store, "node.bin", &mut agent, FLASH_BASE, &mut ReplyLoss::new(7)).unwrap();

        assert_eq!(outcome, Ok(()));
        assert!(report.dropped > 0);
        assert_eq!(report.bytes_sent, 0x3000);
        assert!(report.reset_after.is_some());
        assert!(node_holds(&agent, FLASH_BASE, &image));
    }

    #[test]
    fn losing_every_reply_times_out() {
        let mut store = MemoryStore::new();
        store.insert("notes.txt", vec![1u8; 100]);

        let mut mem = vec![0u8; NODE_FLASH_SIZE];
        let mut agent = node(&mut mem);
        let staging = FLASH_BASE + FIRMWARE_REGION_SIZE;
        let (outcome, report) =
            simulate(store, "notes.txt", &mut agent, staging, &mut ReplyLoss::new(1)).unwrap();

        assert_eq!(outcome, Err(NackReason::ServerTimeout));
        assert_eq!(report.requests, 11);
        assert_eq!(report.dropped, 11);
    }

    #[test]
    fn packed_blob_is_served_from_a_raw_slot() {
        let data = vec![0x5Au8; 1500];
        let slot_image = pack_blob("table.lut", &data).unwrap();

        let mut staging_flash = vec![0u8; STAGING_FLASH_SIZE];
        let mut flash = SimFlash::erased(&mut staging_flash);
        let offset = FIRST_RAW_SLOT * FW_SLOT_SIZE as usize;
        flash.contents_mut()[offset..offset + slot_image.len()].copy_from_slice(&slot_image);

        let mut mem = vec![0u8; NODE_FLASH_SIZE];
        let mut agent = node(&mut mem);
        let staging = FLASH_BASE + FIRMWARE_REGION_SIZE;
        let (outcome, report) =
            simulate(SlotStore::new(flash), "slot4", &mut agent, staging, &mut ReplyLoss::new(0)).unwrap();

        assert_eq!(outcome, Ok(()));
        assert_eq!(report.reset_after, None);
        assert_eq!(report.dropped, 0);
        assert!(node_holds(&agent, staging, &data));
    }
}
