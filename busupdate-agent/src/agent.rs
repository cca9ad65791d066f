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

use busupdate_messages::footer::{IMAGE_FOOTER_LEN, IMAGE_INFO_OFFSET};
use busupdate_messages::{CrcCoverage, ImageFooter, NackReason, UpdateMessage, UpdateMessageBuilder};
use embassy_time::{Duration, Instant};
use embedded_storage::nor_flash::NorFlash;
use log::{debug, error, info, trace, warn};

use crate::config::AgentConfig;
use crate::flash::{FlashError, PagedFlash};
use crate::policy::{StrictlyNewer, VersionPolicy};

/// Progress of the transfer currently being received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub footer: ImageFooter,
    pub destination: u32,
    pub expected_sequence: u32,
    pub write_address: u32,
    pub bytes_received: u32,
    pub inactivity_deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Receiving(Transfer),
}

/// Summary of the agent for display on the node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgentStatus {
    pub receiving: bool,
    pub destination: u32,
    pub image_size: u32,
    pub bytes_received: u32,
}

impl AgentStatus {
    pub fn progress_percent(&self) -> u8 {
        if self.image_size == 0 {
            return 0;
        }
        (self.bytes_received as u64 * 100 / self.image_size as u64) as u8
    }
}

/// Something the node must do on the agent's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    /// Boot into the new image once `after` has elapsed.
    ResetDevice { after: Duration },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgentOutput {
    pub reply: Option<UpdateMessage<'static>>,
    pub action: Option<AgentAction>,
}

impl AgentOutput {
    fn reply(message: UpdateMessage<'static>) -> Self {
        Self { reply: Some(message), action: None }
    }

    fn silent() -> Self {
        Self::default()
    }
}

pub struct TargetAgent<F, P = StrictlyNewer> {
    config: AgentConfig,
    flash: PagedFlash<F>,
    policy: P,
    state: AgentState,
}

impl<F: NorFlash> TargetAgent<F, StrictlyNewer> {
    pub fn new(config: AgentConfig, flash: F) -> Self {
        Self::with_policy(config, flash, StrictlyNewer)
    }
}

impl<F: NorFlash, P: VersionPolicy> TargetAgent<F, P> {
    pub fn with_policy(config: AgentConfig, flash: F, policy: P) -> Self {
        Self {
            flash: PagedFlash::new(flash, config.flash_base),
            config,
            policy,
            state: AgentState::Idle,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, AgentState::Receiving(_))
    }

    pub fn status(&self) -> AgentStatus {
        match self.state {
            AgentState::Idle => AgentStatus::default(),
            AgentState::Receiving(transfer) => AgentStatus {
                receiving: true,
                destination: transfer.destination,
                image_size: transfer.footer.size,
                bytes_received: transfer.bytes_received,
            },
        }
    }

    pub fn flash(&self) -> &PagedFlash<F> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut PagedFlash<F> {
        &mut self.flash
    }

    fn builder(&self) -> UpdateMessageBuilder {
        UpdateMessageBuilder::new(self.config.node_address)
    }

    /// Handle one update payload received at `now`.
    ///
    /// Undecodable payloads and messages for other nodes produce no output.
    pub fn process_message(&mut self, now: Instant, payload: &[u8]) -> AgentOutput {
        let message = match UpdateMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed update payload: {:?}", e);
                return AgentOutput::silent();
            }
        };

        if message.target() != self.config.node_address {
            return AgentOutput::silent();
        }
        trace!("Agent received {:?}", message.sub_command());

        if let AgentState::Receiving(transfer) = &mut self.state {
            transfer.inactivity_deadline = now + self.config.inactivity_timeout;
        }

        match (self.is_active(), message) {
            (false, UpdateMessage::StartRequest { footer, destination, .. }) => {
                self.begin_transfer(now, footer, destination)
            }
            (true, UpdateMessage::StartRequest { footer, destination, .. }) => {
                self.repeated_start(footer, destination)
            }
            (true, UpdateMessage::DataPacket { sequence, chunk, .. }) => {
                self.accept_chunk(sequence, chunk)
            }
            (true, UpdateMessage::FinishRequest { crc32, .. }) => self.finish(crc32),
            (_, message) => {
                trace!("Ignoring {:?}", message.sub_command());
                AgentOutput::silent()
            }
        }
    }

    /// Abandon a transfer that has gone quiet. Returns true if one was aborted.
    pub fn service(&mut self, now: Instant) -> bool {
        match self.state {
            AgentState::Receiving(transfer) if now > transfer.inactivity_deadline => {
                warn!(
                    "Transfer to 0x{:08x} inactive, aborting after {} bytes",
                    transfer.destination, transfer.bytes_received
                );
                self.abort();
                true
            }
            _ => false,
        }
    }

    /// Footer of the image currently in the firmware region, if there is one.
    pub fn installed_footer(&mut self) -> Option<ImageFooter> {
        let region = self.config.firmware;
        if region.size < IMAGE_INFO_OFFSET + IMAGE_FOOTER_LEN as u32 {
            return None;
        }

        let mut bytes = [0u8; IMAGE_FOOTER_LEN];
        if let Err(e) = self.flash.read(region.address + IMAGE_INFO_OFFSET, &mut bytes) {
            warn!("Unable to read installed footer: {:?}", e);
            return None;
        }
        ImageFooter::from_bytes(&bytes).ok().filter(|footer| !footer.is_blank())
    }

    fn begin_transfer(&mut self, now: Instant, mut footer: ImageFooter, destination: u32) -> AgentOutput {
        let builder = self.builder();

        if footer.size == 0 {
            warn!("Rejecting empty image");
            return AgentOutput::reply(builder.start_nack(NackReason::InvalidVersion));
        }
        if !self.flash.contains(destination, footer.size) {
            warn!("Image of {} bytes does not fit at 0x{:08x}", footer.size, destination);
            return AgentOutput::reply(builder.start_nack(NackReason::FileTooLarge));
        }

        if self.config.is_firmware_destination(destination) {
            if footer.size > self.config.firmware.size {
                warn!(
                    "Firmware of {} bytes exceeds region of {} bytes",
                    footer.size, self.config.firmware.size
                );
                return AgentOutput::reply(builder.start_nack(NackReason::FileTooLarge));
            }
            let installed = self.installed_footer();
            if !self.policy.is_newer(installed.as_ref(), &footer) {
                warn!(
                    "Offered version 0x{:08x} is not newer than installed 0x{:08x}",
                    footer.version,
                    installed.map(|f| f.version).unwrap_or_default()
                );
                return AgentOutput::reply(builder.start_nack(NackReason::InvalidVersion));
            }
        }

        if let Err(e) = self.flash.erase_range(destination, footer.size) {
            error!("Erase of 0x{:08x} failed: {:?}", destination, e);
            return AgentOutput::reply(builder.start_nack(NackReason::EraseFailed));
        }

        footer.load_addr = destination;
        self.state = AgentState::Receiving(Transfer {
            footer,
            destination,
            expected_sequence: 0,
            write_address: destination,
            bytes_received: 0,
            inactivity_deadline: now + self.config.inactivity_timeout,
        });
        info!(
            "Receiving {} bytes, version 0x{:08x}, into 0x{:08x}",
            footer.size, footer.version, destination
        );
        AgentOutput::reply(builder.start_ack())
    }

    fn repeated_start(&mut self, footer: ImageFooter, destination: u32) -> AgentOutput {
        let builder = self.builder();
        let AgentState::Receiving(transfer) = &self.state else {
            return AgentOutput::silent();
        };

        // The coordinator resends START when our ACK was lost. Nothing has been written
        // yet so the erase already done still holds.
        if transfer.bytes_received == 0
            && transfer.destination == destination
            && transfer.footer == footer
        {
            debug!("Repeated START for 0x{:08x}, re-acknowledging", destination);
            return AgentOutput::reply(builder.start_ack());
        }

        // No reply. The coordinator's START retry arrives after the inactivity timeout.
        warn!("START received mid-transfer, ignoring");
        AgentOutput::silent()
    }

    fn accept_chunk(&mut self, sequence: u32, chunk: &[u8]) -> AgentOutput {
        let builder = self.builder();
        let AgentState::Receiving(transfer) = &mut self.state else {
            return AgentOutput::silent();
        };

        if sequence < transfer.expected_sequence {
            debug!("Duplicate chunk {}, re-acknowledging", sequence);
            return AgentOutput::reply(builder.data_ack(sequence));
        }
        if sequence > transfer.expected_sequence {
            debug!(
                "Chunk {} ahead of expected {}, dropping",
                sequence, transfer.expected_sequence
            );
            return AgentOutput::silent();
        }

        let len = chunk.len() as u32;
        if transfer.bytes_received as u64 + len as u64 > transfer.footer.size as u64 {
            warn!("Chunk {} overruns the announced image size", sequence);
            self.abort();
            return AgentOutput::reply(builder.data_nack(NackReason::UnexpectedPacket));
        }

        match self.flash.write(transfer.write_address, chunk) {
            Ok(()) => {
                transfer.write_address += len;
                transfer.bytes_received += len;
                transfer.expected_sequence += 1;
                AgentOutput::reply(builder.data_ack(sequence))
            }
            Err(e) => {
                error!("Write at 0x{:08x} failed: {:?}", transfer.write_address, e);
                self.abort();
                AgentOutput::reply(builder.data_nack(NackReason::WriteFailed))
            }
        }
    }

    fn finish(&mut self, requested_crc: u32) -> AgentOutput {
        let builder = self.builder();
        let AgentState::Receiving(transfer) = self.state else {
            return AgentOutput::silent();
        };

        if transfer.bytes_received != transfer.footer.size {
            warn!(
                "FINISH after {} of {} bytes",
                transfer.bytes_received, transfer.footer.size
            );
            self.abort();
            return AgentOutput::reply(builder.finish_nack(NackReason::SizeMismatch));
        }

        if !self.config.is_firmware_destination(transfer.destination) {
            info!("Blob of {} bytes stored at 0x{:08x}", transfer.footer.size, transfer.destination);
            self.state = AgentState::Idle;
            return AgentOutput::reply(builder.finish_ack());
        }

        match self.verify(&transfer, requested_crc) {
            Ok(()) => {
                info!("Firmware version 0x{:08x} verified, resetting", transfer.footer.version);
                self.state = AgentState::Idle;
                AgentOutput {
                    reply: Some(builder.finish_ack()),
                    action: Some(AgentAction::ResetDevice { after: self.config.reset_delay }),
                }
            }
            Err(reason) => {
                self.abort();
                AgentOutput::reply(builder.finish_nack(reason))
            }
        }
    }

    fn verify(&mut self, transfer: &Transfer, requested_crc: u32) -> Result<(), NackReason> {
        let crc = self
            .flash
            .crc(transfer.destination, transfer.footer.size, CrcCoverage::Firmware)
            .map_err(|e: FlashError| {
                error!("Unable to read back image: {:?}", e);
                NackReason::InternalError
            })?;

        if crc != requested_crc || crc != transfer.footer.crc32 {
            warn!(
                "CRC mismatch: flash 0x{:08x}, requested 0x{:08x}, footer 0x{:08x}",
                crc, requested_crc, transfer.footer.crc32
            );
            return Err(NackReason::CrcMismatch);
        }
        Ok(())
    }

    /// Drop the current transfer, erasing whatever was written. Erase failures are
    /// logged only.
    fn abort(&mut self) {
        if let AgentState::Receiving(transfer) = self.state {
            if let Err(e) = self.flash.erase_range(transfer.destination, transfer.footer.size) {
                error!("Cleanup erase of 0x{:08x} failed: {:?}", transfer.destination, e);
            }
        }
        self.state = AgentState::Idle;
    }
}
