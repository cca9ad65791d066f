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
use busupdate_messages::update::EncodedMessage;
use busupdate_messages::{CrcCoverage, ImageFooter, UpdateMessage};
use embassy_time::Instant;

use crate::config::CoordinatorConfig;
use crate::session::{Session, SessionInfo, Tick};
use crate::source::{ImageSource, SourceError, SourceKind, SourceStore, read_exact_at};
use crate::util::calculate_source_crc;

pub const DEFAULT_MAX_SESSIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSessionError {
    /// A session for this client has not been cleaned up yet
    Duplicate,
    NoFreeSlot,
    SourceUnavailable,
    /// Footer missing or inconsistent, or the image fails its CRC check
    InvalidImage,
}

/// One request to put on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: u8,
    pub payload: EncodedMessage,
}

/// Drives up to `MAX_SESSIONS` concurrent transfers, one per client address.
pub struct Coordinator<S: SourceStore, const MAX_SESSIONS: usize = DEFAULT_MAX_SESSIONS> {
    config: CoordinatorConfig,
    store: S,
    sessions: [Option<Session<S::Source>>; MAX_SESSIONS],
    sources_in_use: usize,
}

impl<S: SourceStore, const MAX_SESSIONS: usize> Coordinator<S, MAX_SESSIONS> {
    pub fn new(store: S, config: CoordinatorConfig) -> Self {
        Self {
            config,
            store,
            sessions: core::array::from_fn(|_| None),
            sources_in_use: 0,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Begin sending image `name` to `client`, to be written at `staging`.
    ///
    /// Nothing is sent until the next [`Coordinator::service`].
    pub fn start_session(&mut self, client: u8, name: &str, staging: u32) -> Result<(), StartSessionError> {
        if self.session_for(client).is_some() {
            log::warn!("Node {client} already has an update in progress");
            return Err(StartSessionError::Duplicate);
        }
        let slot = self
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(StartSessionError::NoFreeSlot)?;

        if self.sources_in_use == 0 {
            self.store.mount().map_err(|e| {
                log::warn!("Unable to mount image store: {:?}", e);
                StartSessionError::SourceUnavailable
            })?;
        }

        let prepared = match self.store.open(name) {
            Ok(mut source) => prepare_footer(&mut source, &self.config).map(|footer| (source, footer)),
            Err(e) => {
                log::warn!("Unable to open {name}: {:?}", e);
                Err(StartSessionError::SourceUnavailable)
            }
        };
        let (source, footer) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if self.sources_in_use == 0 {
                    self.store.unmount();
                }
                return Err(e);
            }
        };

        log::info!(
            "Session {slot}: sending {name} ({} bytes, version 0x{:08x}) to node {client} at 0x{staging:08x}",
            footer.size,
            footer.version
        );
        self.sources_in_use += 1;
        self.sessions[slot] = Some(Session::new(client, source, footer, staging, self.config.retry_budget));
        Ok(())
    }

    /// One cooperative tick over every session. Each session contributes at most one
    /// request.
    pub fn service(&mut self, now: Instant) -> heapless::Vec<Outbound, MAX_SESSIONS> {
        let mut outbound = heapless::Vec::new();

        for index in 0..MAX_SESSIONS {
            let Some(session) = self.sessions[index].as_mut() else {
                continue;
            };
            match session.tick(now, &self.config) {
                Tick::Send(payload) => {
                    // At most one entry per slot, so this cannot overflow.
                    let _ = outbound.push(Outbound { target: session.client, payload });
                }
                Tick::Nothing => {}
                Tick::Cleanup => self.cleanup(index),
            }
        }
        outbound
    }

    /// Route a reply payload to the session owning its address.
    pub fn process_response(&mut self, now: Instant, payload: &[u8]) {
        let message = match UpdateMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping malformed update reply: {:?}", e);
                return;
            }
        };

        let Some(index) = self.session_for(message.target()) else {
            log::trace!("No session for node {}, ignoring {:?}", message.target(), message.sub_command());
            return;
        };
        if let Some(session) = self.sessions[index].as_mut() {
            session.handle(now, &message, self.config.retry_budget);
        }
    }

    pub fn get_session_info(&self, index: usize) -> Option<SessionInfo> {
        self.sessions.get(index)?.as_ref().map(Session::info)
    }

    /// Slot index of the session for `address`, if there is one.
    pub fn session_for(&self, address: u8) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.as_ref().is_some_and(|s| s.client == address))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|session| session.is_some()).count()
    }

    fn cleanup(&mut self, index: usize) {
        let Some(session) = self.sessions[index].take() else {
            return;
        };
        log::debug!("Session {index} for node {} released", session.client);
        drop(session);

        self.sources_in_use = self.sources_in_use.saturating_sub(1);
        if self.sources_in_use == 0 {
            self.store.unmount();
        }
    }
}

/// Work out the footer to announce for a freshly opened source.
fn prepare_footer<Src: ImageSource>(
    source: &mut Src,
    config: &CoordinatorConfig,
) -> Result<ImageFooter, StartSessionError> {
    let unreadable = |e: SourceError| {
        log::warn!("Unable to read image source: {:?}", e);
        StartSessionError::SourceUnavailable
    };

    let (footer, coverage) = match source.kind() {
        SourceKind::Firmware => {
            if source.len() < IMAGE_INFO_OFFSET + IMAGE_FOOTER_LEN as u32 {
                log::warn!("Firmware image of {} bytes has no footer", source.len());
                return Err(StartSessionError::InvalidImage);
            }
            let mut bytes = [0u8; IMAGE_FOOTER_LEN];
            read_exact_at(source, IMAGE_INFO_OFFSET, &mut bytes).map_err(unreadable)?;
            let footer = ImageFooter::from_bytes(&bytes).map_err(|_| StartSessionError::InvalidImage)?;
            footer.validate(config.max_image_size).map_err(|e| {
                log::warn!("Firmware footer rejected: {:?}", e);
                StartSessionError::InvalidImage
            })?;
            (footer, CrcCoverage::Firmware)
        }
        SourceKind::RawSlot => {
            let blob = source.blob_footer().ok_or(StartSessionError::InvalidImage)?;
            blob.check().map_err(|e| {
                log::warn!("Raw slot header rejected: {:?}", e);
                StartSessionError::InvalidImage
            })?;
            if blob.size > config.max_image_size {
                return Err(StartSessionError::InvalidImage);
            }
            (blob.to_image_footer(), CrcCoverage::Raw)
        }
        SourceKind::Data => {
            let size = source.len();
            if size == 0 || size > config.max_image_size {
                log::warn!("Data source of {size} bytes cannot be sent");
                return Err(StartSessionError::InvalidImage);
            }
            let crc32 = calculate_source_crc(source, size, CrcCoverage::Raw).map_err(unreadable)?;
            return Ok(ImageFooter { size, crc32, ..Default::default() });
        }
    };

    if footer.size > source.len() {
        log::warn!("Footer claims {} bytes but the source holds {}", footer.size, source.len());
        return Err(StartSessionError::InvalidImage);
    }
    if config.verify_source_crc {
        let crc = calculate_source_crc(source, footer.size, coverage).map_err(unreadable)?;
        if crc != footer.crc32 {
            log::warn!("Source CRC 0x{crc:08x} does not match footer 0x{:08x}", footer.crc32);
            return Err(StartSessionError::InvalidImage);
        }
    }
    Ok(footer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::source::MemoryStore;
    use busupdate_messages::{ImageCrc, NackReason, RawBlobFooter, UpdateMessageBuilder};
    use embassy_time::Duration;

    const STAGING: u32 = 0x0800_0000;

    fn firmware(len: usize) -> Vec<u8> {
        let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let footer = ImageFooter {
            size: len as u32,
            crc32: ImageCrc::checksum(CrcCoverage::Firmware, &image),
            version: 2,
            write_addr: STAGING,
            load_addr: STAGING,
        };
        let at = IMAGE_INFO_OFFSET as usize;
        image[at..at + IMAGE_FOOTER_LEN].copy_from_slice(&footer.to_bytes());
        image
    }

    fn coordinator() -> Coordinator<MemoryStore> {
        let mut store = MemoryStore::new();
        store.insert("app.bin", firmware(0x2100));
        store.insert("notes.txt", vec![7u8; 2600]);
        Coordinator::new(store, CoordinatorConfig::default())
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn reply(message: UpdateMessage<'_>) -> EncodedMessage {
        message.to_vec().unwrap()
    }

    fn sub_command_of(outbound: &Outbound) -> busupdate_messages::SubCommand {
        UpdateMessage::decode(&outbound.payload).unwrap().sub_command()
    }

    #[test]
    fn start_session_announces_footer_on_next_tick() {
        let mut coordinator = coordinator();
        coordinator.start_session(3, "app.bin", STAGING).unwrap();

        let sent = coordinator.service(at(0));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, 3);
        match UpdateMessage::decode(&sent[0].payload).unwrap() {
            UpdateMessage::StartRequest { footer, destination, .. } => {
                assert_eq!(footer.size, 0x2100);
                assert_eq!(destination, STAGING);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(coordinator.get_session_info(0).unwrap().state, SessionState::WaitingStartAck);
    }

    #[test]
    fn data_source_gets_a_computed_footer() {
        let mut coordinator = coordinator();
        coordinator.start_session(4, "notes.txt", 0x9000_0000).unwrap();

        let sent = coordinator.service(at(0));
        let UpdateMessage::StartRequest { footer, .. } = UpdateMessage::decode(&sent[0].payload).unwrap()
        else {
            panic!("expected START_REQUEST");
        };
        assert_eq!(footer.size, 2600);
        assert_eq!(footer.crc32, ImageCrc::checksum(CrcCoverage::Raw, &[7u8; 2600]));
        assert_eq!(coordinator.get_session_info(0).unwrap().kind, SourceKind::Data);
    }

    #[test]
    fn corrupted_firmware_is_rejected_before_mounting_twice() {
        let mut image = firmware(0x2100);
        image[10] ^= 0xFF;
        let mut store = MemoryStore::new();
        store.insert("bad.bin", image);
        let mut coordinator: Coordinator<_> = Coordinator::new(store, CoordinatorConfig::default());

        assert_eq!(
            coordinator.start_session(1, "bad.bin", STAGING),
            Err(StartSessionError::InvalidImage)
        );
        assert_eq!(coordinator.active_sessions(), 0);
        assert_eq!(coordinator.store().mount_count, 1);
        assert_eq!(coordinator.store().unmount_count, 1);
    }

    #[test]
    fn image_without_footer_is_invalid() {
        let mut store = MemoryStore::new();
        store.insert("tiny.bin", vec![0u8; 100]);
        store.insert("blank.bin", vec![0xFFu8; 0x3000]);
        let mut coordinator: Coordinator<_> = Coordinator::new(store, CoordinatorConfig::default());

        assert_eq!(coordinator.start_session(1, "tiny.bin", STAGING), Err(StartSessionError::InvalidImage));
        assert_eq!(coordinator.start_session(1, "blank.bin", STAGING), Err(StartSessionError::InvalidImage));
        assert_eq!(coordinator.start_session(1, "gone.bin", STAGING), Err(StartSessionError::SourceUnavailable));
    }

    #[test]
    fn raw_slot_header_must_be_valid_and_match() {
        let data = vec![0x3Cu8; 500];
        let crc = ImageCrc::checksum(CrcCoverage::Raw, &data);
        let mut store = MemoryStore::new();
        store.insert_blob("good", RawBlobFooter::new("good.dat", 500, crc), data.clone());
        store.insert_blob("stale", RawBlobFooter::new("stale.dat", 500, crc ^ 1), data.clone());
        let mut unfinished = RawBlobFooter::new("partial.dat", 500, crc);
        unfinished.valid = 0;
        store.insert_blob("partial", unfinished, data);
        let mut coordinator: Coordinator<_> = Coordinator::new(store, CoordinatorConfig::default());

        assert_eq!(coordinator.start_session(1, "stale", STAGING), Err(StartSessionError::InvalidImage));
        assert_eq!(coordinator.start_session(1, "partial", STAGING), Err(StartSessionError::InvalidImage));
        assert_eq!(coordinator.start_session(1, "good", STAGING), Ok(()));
        assert_eq!(coordinator.get_session_info(0).unwrap().kind, SourceKind::RawSlot);
    }

    #[test]
    fn store_is_mounted_once_for_concurrent_sessions() {
        let mut coordinator = coordinator();
        coordinator.start_session(1, "app.bin", STAGING).unwrap();
        coordinator.start_session(2, "notes.txt", STAGING).unwrap();
        assert_eq!(coordinator.store().mount_count, 1);

        coordinator.service(at(0));
        coordinator.process_response(at(1), &reply(UpdateMessageBuilder::new(1).start_nack(NackReason::EraseFailed)));
        coordinator.service(at(2));
        coordinator.service(at(3));
        assert_eq!(coordinator.active_sessions(), 1);
        assert_eq!(coordinator.store().unmount_count, 0);

        coordinator.process_response(at(4), &reply(UpdateMessageBuilder::new(2).start_nack(NackReason::EraseFailed)));
        coordinator.service(at(5));
        coordinator.service(at(6));
        assert_eq!(coordinator.active_sessions(), 0);
        assert_eq!(coordinator.store().unmount_count, 1);
        assert!(!coordinator.store().is_mounted());
    }

    #[test]
    fn terminal_state_is_visible_for_one_tick() {
        let mut coordinator = coordinator();
        coordinator.start_session(1, "app.bin", STAGING).unwrap();
        coordinator.service(at(0));

        coordinator.process_response(at(1), &reply(UpdateMessageBuilder::new(1).start_nack(NackReason::InvalidVersion)));
        let info = coordinator.get_session_info(0).unwrap();
        assert_eq!(info.state, SessionState::Failed);
        assert_eq!(info.fail_reason_text(), "Error: Version");

        coordinator.service(at(2));
        let info = coordinator.get_session_info(0).unwrap();
        assert_eq!(info.state, SessionState::PendingCleanup);
        assert_eq!(info.outcome, Some(Err(NackReason::InvalidVersion)));

        coordinator.service(at(3));
        assert_eq!(coordinator.get_session_info(0), None);
    }

    #[test]
    fn wrong_sequence_ack_is_ignored() {
        let mut coordinator = coordinator();
        coordinator.start_session(1, "notes.txt", STAGING).unwrap();
        coordinator.service(at(0));
        coordinator.process_response(at(1), &reply(UpdateMessageBuilder::new(1).start_ack()));

        let sent = coordinator.service(at(2));
        assert_eq!(sub_command_of(&sent[0]), busupdate_messages::SubCommand::DataPacket);

        coordinator.process_response(at(3), &reply(UpdateMessageBuilder::new(1).data_ack(4)));
        let info = coordinator.get_session_info(0).unwrap();
        assert_eq!(info.sequence, 0);
        assert_eq!(info.bytes_sent, 0);
        assert_eq!(info.state, SessionState::WaitingDataAck);

        coordinator.process_response(at(4), &reply(UpdateMessageBuilder::new(1).data_ack(0)));
        let info = coordinator.get_session_info(0).unwrap();
        assert_eq!(info.sequence, 1);
        assert_eq!(info.bytes_sent, 256);
        assert_eq!(info.progress_percent(), 9);
    }

    #[test]
    fn timeout_resends_the_same_request() {
        let mut coordinator = coordinator();
        coordinator.start_session(1, "notes.txt", STAGING).unwrap();
        let first = coordinator.service(at(0));

        assert!(coordinator.service(at(6000)).is_empty());
        assert!(coordinator.service(at(6001)).is_empty());
        let again = coordinator.service(at(6002));
        assert_eq!(again, first);
        assert_eq!(coordinator.get_session_info(0).unwrap().retries_left, 9);
    }

    #[test]
    fn replies_for_unknown_nodes_are_ignored() {
        let mut coordinator = coordinator();
        coordinator.process_response(at(0), &reply(UpdateMessageBuilder::new(9).start_ack()));
        coordinator.process_response(at(0), &[0xFF, 0x00]);
        assert_eq!(coordinator.active_sessions(), 0);
    }

    #[test]
    fn custom_chunk_size_is_honoured() {
        let store = {
            let mut store = MemoryStore::new();
            store.insert("notes.txt", vec![1u8; 100]);
            store
        };
        let config = CoordinatorConfig {
            chunk_size: 64,
            data_ack_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let mut coordinator: Coordinator<_, 2> = Coordinator::new(store, config);
        coordinator.start_session(1, "notes.txt", STAGING).unwrap();
        coordinator.service(at(0));
        coordinator.process_response(at(1), &reply(UpdateMessageBuilder::new(1).start_ack()));

        let sent = coordinator.service(at(2));
        let UpdateMessage::DataPacket { chunk, .. } = UpdateMessage::decode(&sent[0].payload).unwrap() else {
            panic!("expected DATA_PACKET");
        };
        assert_eq!(chunk.len(), 64);
    }
}
