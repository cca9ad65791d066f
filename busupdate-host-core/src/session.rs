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

use busupdate_messages::update::{EncodedMessage, MAX_CHUNK_SIZE};
use busupdate_messages::{ImageFooter, NackReason, UpdateMessage, UpdateMessageBuilder};
use embassy_time::{Duration, Instant};

use crate::config::CoordinatorConfig;
use crate::source::{ImageSource, SourceKind, read_exact_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    WaitingStartAck,
    SendingData,
    WaitingDataAck,
    Finishing,
    WaitingFinishAck,
    CompletedOk,
    Failed,
    /// Terminal state has been reported; the slot is freed on the next tick
    PendingCleanup,
}

/// Read-only view of one session, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub client: u8,
    pub state: SessionState,
    pub kind: SourceKind,
    pub image_size: u32,
    pub destination: u32,
    pub bytes_sent: u32,
    pub sequence: u32,
    pub retries_left: u32,
    pub fail_reason: NackReason,
    /// Set once the session has finished, whichever way
    pub outcome: Option<Result<(), NackReason>>,
}

impl SessionInfo {
    pub fn progress_percent(&self) -> u8 {
        if self.image_size == 0 {
            return 0;
        }
        (self.bytes_sent as u64 * 100 / self.image_size as u64) as u8
    }

    pub fn fail_reason_text(&self) -> &'static str {
        self.fail_reason.as_text()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

pub(crate) enum Tick {
    Send(EncodedMessage),
    Nothing,
    Cleanup,
}

pub(crate) struct Session<Src> {
    pub(crate) client: u8,
    source: Src,
    footer: ImageFooter,
    destination: u32,
    bytes_sent: u32,
    sequence: u32,
    last_packet_size: u32,
    retries_left: u32,
    state: SessionState,
    timeout_start: Instant,
    fail_reason: NackReason,
    outcome: Option<Result<(), NackReason>>,
}

impl<Src: ImageSource> Session<Src> {
    pub(crate) fn new(
        client: u8,
        source: Src,
        footer: ImageFooter,
        destination: u32,
        retry_budget: u32,
    ) -> Self {
        Self {
            client,
            source,
            footer,
            destination,
            bytes_sent: 0,
            sequence: 0,
            last_packet_size: 0,
            retries_left: retry_budget,
            state: SessionState::Starting,
            timeout_start: Instant::from_ticks(0),
            fail_reason: NackReason::None,
            outcome: None,
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            client: self.client,
            state: self.state,
            kind: self.source.kind(),
            image_size: self.footer.size,
            destination: self.destination,
            bytes_sent: self.bytes_sent,
            sequence: self.sequence,
            retries_left: self.retries_left,
            fail_reason: self.fail_reason,
            outcome: self.outcome,
        }
    }

    /// Advance by one coordinator tick, producing at most one request.
    pub(crate) fn tick(&mut self, now: Instant, config: &CoordinatorConfig) -> Tick {
        let builder = UpdateMessageBuilder::new(self.client);

        match self.state {
            SessionState::Starting => {
                let request = builder.start_request(&self.footer, self.destination);
                self.send(now, request, SessionState::WaitingStartAck)
            }
            SessionState::WaitingStartAck => {
                self.check_timeout(now, config.start_ack_timeout, SessionState::Starting)
            }
            SessionState::SendingData => {
                let remaining = (self.footer.size - self.bytes_sent) as usize;
                let len = remaining.min(config.effective_chunk_size());
                let mut chunk = [0u8; MAX_CHUNK_SIZE];

                if let Err(e) = read_exact_at(&mut self.source, self.bytes_sent, &mut chunk[..len]) {
                    log::error!(
                        "Node {}: unable to read source at offset {}: {:?}",
                        self.client,
                        self.bytes_sent,
                        e
                    );
                    self.fail(NackReason::InternalError);
                    return Tick::Nothing;
                }

                log::trace!(
                    "Node {}: sending chunk {} ({} bytes at offset {})",
                    self.client,
                    self.sequence,
                    len,
                    self.bytes_sent
                );
                self.last_packet_size = len as u32;
                let packet = builder.data_packet(self.sequence, &chunk[..len]);
                self.send(now, packet, SessionState::WaitingDataAck)
            }
            SessionState::WaitingDataAck => {
                self.check_timeout(now, config.data_ack_timeout, SessionState::SendingData)
            }
            SessionState::Finishing => {
                let request = builder.finish_request(self.footer.crc32);
                self.send(now, request, SessionState::WaitingFinishAck)
            }
            SessionState::WaitingFinishAck => {
                self.check_timeout(now, config.finish_ack_timeout, SessionState::Finishing)
            }
            SessionState::CompletedOk => {
                log::info!(
                    "Node {}: update complete, {} bytes to 0x{:08x}",
                    self.client,
                    self.bytes_sent,
                    self.destination
                );
                self.state = SessionState::PendingCleanup;
                Tick::Nothing
            }
            SessionState::Failed => {
                log::warn!(
                    "Node {}: update failed after {} bytes: {}",
                    self.client,
                    self.bytes_sent,
                    self.fail_reason.as_text()
                );
                self.state = SessionState::PendingCleanup;
                Tick::Nothing
            }
            SessionState::PendingCleanup => Tick::Cleanup,
        }
    }

    /// Feed one reply addressed to this session's client.
    pub(crate) fn handle(&mut self, now: Instant, message: &UpdateMessage<'_>, retry_budget: u32) {
        match (self.state, *message) {
            (SessionState::WaitingStartAck, UpdateMessage::StartAck { .. }) => {
                log::info!(
                    "Node {}: accepted image of {} bytes after {} ms",
                    self.client,
                    self.footer.size,
                    self.elapsed(now).as_millis()
                );
                self.retries_left = retry_budget;
                self.state = SessionState::SendingData;
            }
            (SessionState::WaitingDataAck, UpdateMessage::DataAck { sequence, .. })
                if sequence == self.sequence =>
            {
                self.bytes_sent += self.last_packet_size;
                self.sequence += 1;
                self.retries_left = retry_budget;
                self.state = if self.bytes_sent >= self.footer.size {
                    log::debug!("Node {}: all {} bytes acknowledged", self.client, self.bytes_sent);
                    SessionState::Finishing
                } else {
                    SessionState::SendingData
                };
            }
            (SessionState::WaitingFinishAck, UpdateMessage::FinishAck { .. }) => {
                self.outcome = Some(Ok(()));
                self.state = SessionState::CompletedOk;
            }
            (SessionState::WaitingStartAck, UpdateMessage::StartNack { reason, .. })
            | (SessionState::WaitingDataAck, UpdateMessage::DataNack { reason, .. })
            | (SessionState::WaitingFinishAck, UpdateMessage::FinishNack { reason, .. }) => {
                log::warn!("Node {}: rejected with {:?}", self.client, reason);
                self.fail(reason);
            }
            (state, message) => {
                log::trace!(
                    "Node {}: ignoring {:?} in {:?}",
                    self.client,
                    message.sub_command(),
                    state
                );
            }
        }
    }

    fn send(&mut self, now: Instant, message: UpdateMessage<'_>, next: SessionState) -> Tick {
        match message.to_vec() {
            Ok(payload) => {
                self.state = next;
                self.timeout_start = now;
                Tick::Send(payload)
            }
            Err(e) => {
                log::error!("Node {}: unable to encode {:?}: {:?}", self.client, message.sub_command(), e);
                self.fail(NackReason::InternalError);
                Tick::Nothing
            }
        }
    }

    fn check_timeout(&mut self, now: Instant, timeout: Duration, resend: SessionState) -> Tick {
        if self.elapsed(now) <= timeout {
            return Tick::Nothing;
        }

        if self.retries_left > 0 {
            self.retries_left -= 1;
            log::debug!(
                "Node {}: no reply in {:?}, resending ({} retries left)",
                self.client,
                self.state,
                self.retries_left
            );
            self.state = resend;
        } else {
            self.fail(NackReason::ServerTimeout);
        }
        Tick::Nothing
    }

    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timeout_start)
    }

    fn fail(&mut self, reason: NackReason) {
        self.fail_reason = reason;
        self.outcome = Some(Err(reason));
        self.state = SessionState::Failed;
    }
}
