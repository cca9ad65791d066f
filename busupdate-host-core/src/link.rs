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

//! Glue between the coordinator and whatever carries typed messages to the bus.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::io::BufRead;

use busupdate_messages::update::MAX_UPDATE_MESSAGE_LEN;
use busupdate_messages::{BusFrame, FIRMWARE_UPDATE_MSG_TYPE, FrameError};
use circular_buffer::CircularBuffer;
use embassy_time::Instant;

use crate::coordinator::Coordinator;
use crate::source::SourceStore;

/// Largest payload accepted from a transport in one message.
pub const MAX_INBOUND_PAYLOAD: usize = 512;

/// Typed, addressed message delivery. The target address travels inside the payload.
pub trait Transport {
    type Error: core::fmt::Debug;

    fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Self::Error>;

    /// Copy the next pending inbound message into `buffer` without blocking.
    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<(u8, usize)>, Self::Error>;
}

/// One cooperative tick: send whatever the sessions want to send, then route every
/// pending update reply back into the coordinator. Other message types are dropped.
pub fn pump<S, T, const MAX_SESSIONS: usize>(
    coordinator: &mut Coordinator<S, MAX_SESSIONS>,
    transport: &mut T,
    now: Instant,
) -> Result<(), T::Error>
where
    S: SourceStore,
    T: Transport,
{
    for outbound in coordinator.service(now) {
        transport.send(FIRMWARE_UPDATE_MSG_TYPE, &outbound.payload)?;
    }

    let mut buffer = [0u8; MAX_INBOUND_PAYLOAD];
    while let Some((msg_type, len)) = transport.receive(&mut buffer)? {
        if msg_type == FIRMWARE_UPDATE_MSG_TYPE {
            coordinator.process_response(now, &buffer[..len]);
        } else {
            log::trace!("Ignoring message type 0x{msg_type:02x}");
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    FramingError(FrameError),
    RxBufferNotEnoughSpace,
    /// Frame larger than the accumulator or the caller's buffer, value is the length needed
    FrameTooLarge(usize),
}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        LinkError::FramingError(err)
    }
}

/// Encode one [`BusFrame`] with its length prefix into `buffer`.
pub fn encode_frame(msg_type: u8, payload: &[u8], buffer: &mut [u8]) -> Result<usize, FrameError> {
    busupdate_messages::frame_message(&BusFrame { msg_type, payload }, buffer)
}

/// Reassembles length-prefixed [`BusFrame`]s from a byte stream that may deliver them
/// in arbitrary pieces.
pub struct FrameAccumulator<const BUFFER_SIZE: usize> {
    rx_buffer: CircularBuffer<BUFFER_SIZE, u8>,
}

impl<const BUFFER_SIZE: usize> Default for FrameAccumulator<BUFFER_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BUFFER_SIZE: usize> FrameAccumulator<BUFFER_SIZE> {
    pub fn new() -> Self {
        Self { rx_buffer: CircularBuffer::<BUFFER_SIZE, u8>::new() }
    }

    pub fn len(&self) -> usize {
        self.rx_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx_buffer.is_empty()
    }

    pub fn push(&mut self, incoming_bytes: &[u8]) -> Result<(), LinkError> {
        if incoming_bytes.len() + self.rx_buffer.len() > self.rx_buffer.capacity() {
            return Err(LinkError::RxBufferNotEnoughSpace);
        }
        log::trace!(
            "Adding {} new bytes, {} bytes in buffer",
            incoming_bytes.len(),
            self.rx_buffer.len()
        );
        self.rx_buffer.extend_from_slice(incoming_bytes);
        Ok(())
    }

    /// Pop the next complete frame, copying its payload into `payload`.
    ///
    /// Returns `Ok(None)` until enough bytes have arrived. A frame that cannot be
    /// decoded discards everything buffered so the stream can resynchronise.
    pub fn next_frame(&mut self, payload: &mut [u8]) -> Result<Option<(u8, usize)>, LinkError> {
        self.rx_buffer.make_contiguous();
        let (message_buffer, _) = self.rx_buffer.as_slices();

        let (consumed_bytes_count, frame) =
            match busupdate_messages::decode_framed_message::<BusFrame>(message_buffer) {
                Ok(result) => result,
                Err(FrameError::BufferTooSmall(expected_len)) if expected_len > BUFFER_SIZE => {
                    self.rx_buffer.clear();
                    return Err(LinkError::FrameTooLarge(expected_len));
                }
                Err(FrameError::BufferTooSmall(expected_len)) => {
                    log::trace!("Need {expected_len} bytes to decode");
                    return Ok(None);
                }
                Err(e) => {
                    self.rx_buffer.clear();
                    return Err(LinkError::FramingError(e));
                }
            };

        let msg_type = frame.msg_type;
        let len = frame.payload.len();
        let copied = payload.len() >= len;
        if copied {
            payload[..len].copy_from_slice(frame.payload);
        }

        log::trace!("Consumed {} bytes from rx buffer", consumed_bytes_count);
        self.rx_buffer.consume(consumed_bytes_count);

        if !copied {
            return Err(LinkError::FrameTooLarge(len));
        }
        Ok(Some((msg_type, len)))
    }
}

/// In-memory transport: what the coordinator sends is queued for the test or simulator
/// to collect, and replies are injected with [`QueueTransport::deliver`].
#[derive(Debug, Default)]
pub struct QueueTransport {
    sent: VecDeque<(u8, Vec<u8>)>,
    inbound: VecDeque<(u8, Vec<u8>)>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&mut self, msg_type: u8, payload: &[u8]) {
        self.inbound.push_back((msg_type, payload.to_vec()));
    }

    pub fn take_sent(&mut self) -> Vec<(u8, Vec<u8>)> {
        self.sent.drain(..).collect()
    }
}

impl Transport for QueueTransport {
    type Error = Infallible;

    fn send(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), Infallible> {
        self.sent.push_back((msg_type, payload.to_vec()));
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<(u8, usize)>, Infallible> {
        while let Some((msg_type, payload)) = self.inbound.pop_front() {
            if payload.len() > buffer.len() {
                log::warn!("Dropping {} byte message, larger than receive buffer", payload.len());
                continue;
            }
            buffer[..payload.len()].copy_from_slice(&payload);
            return Ok(Some((msg_type, payload.len())));
        }
        Ok(None)
    }
}

const _: () = assert!(MAX_INBOUND_PAYLOAD >= MAX_UPDATE_MESSAGE_LEN);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::source::MemoryStore;
    use busupdate_messages::UpdateMessageBuilder;

    #[test]
    fn frames_split_across_pushes_are_reassembled() {
        let mut wire = [0u8; 64];
        let first = encode_frame(FIRMWARE_UPDATE_MSG_TYPE, &[0x02, 0x05], &mut wire).unwrap();
        let second = encode_frame(0x42, &[1, 2, 3], &mut wire[first..]).unwrap();
        let stream = &wire[..first + second];

        let mut accumulator = FrameAccumulator::<128>::new();
        let mut payload = [0u8; 16];

        accumulator.push(&stream[..3]).unwrap();
        assert_eq!(accumulator.next_frame(&mut payload), Ok(None));

        accumulator.push(&stream[3..]).unwrap();
        assert_eq!(accumulator.next_frame(&mut payload), Ok(Some((FIRMWARE_UPDATE_MSG_TYPE, 2))));
        assert_eq!(&payload[..2], &[0x02, 0x05]);
        assert_eq!(accumulator.next_frame(&mut payload), Ok(Some((0x42, 3))));
        assert_eq!(&payload[..3], &[1, 2, 3]);
        assert!(accumulator.is_empty());
    }

    #[test]
    fn overfull_accumulator_refuses_bytes() {
        let mut accumulator = FrameAccumulator::<8>::new();
        accumulator.push(&[0u8; 6]).unwrap();
        assert_eq!(accumulator.push(&[0u8; 3]), Err(LinkError::RxBufferNotEnoughSpace));
    }

    #[test]
    fn length_prefix_beyond_capacity_is_discarded() {
        let mut accumulator = FrameAccumulator::<32>::new();
        accumulator.push(&[0x10, 0x00, 0x82]).unwrap();
        let mut payload = [0u8; 16];
        assert_eq!(accumulator.next_frame(&mut payload), Err(LinkError::FrameTooLarge(0x1002)));
        assert!(accumulator.is_empty());
    }

    #[test]
    fn garbage_frame_is_discarded() {
        let mut accumulator = FrameAccumulator::<32>::new();
        accumulator.push(&[0x00, 0x02, 0xFF, 0xFF]).unwrap();
        let mut payload = [0u8; 16];
        assert!(matches!(accumulator.next_frame(&mut payload), Err(LinkError::FramingError(_))));
        assert!(accumulator.is_empty());
    }

    #[test]
    fn pump_routes_only_update_replies() {
        let mut store = MemoryStore::new();
        store.insert("notes.txt", vec![5u8; 10]);
        let mut coordinator: Coordinator<_> = Coordinator::new(store, CoordinatorConfig::default());
        let mut transport = QueueTransport::new();
        coordinator.start_session(2, "notes.txt", 0x100).unwrap();

        pump(&mut coordinator, &mut transport, Instant::from_millis(0)).unwrap();
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, FIRMWARE_UPDATE_MSG_TYPE);

        let ack = UpdateMessageBuilder::new(2).start_ack().to_vec().unwrap();
        transport.deliver(0x10, &ack);
        pump(&mut coordinator, &mut transport, Instant::from_millis(1)).unwrap();
        assert_eq!(coordinator.get_session_info(0).unwrap().sequence, 0);
        assert!(transport.take_sent().is_empty());

        transport.deliver(FIRMWARE_UPDATE_MSG_TYPE, &ack);
        pump(&mut coordinator, &mut transport, Instant::from_millis(2)).unwrap();
        pump(&mut coordinator, &mut transport, Instant::from_millis(3)).unwrap();
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1[0], 0x10);
    }
}
