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

use crate::footer::ImageFooter;
use crate::update::{NackReason, UpdateMessage};

/// A builder for creating `UpdateMessage`s addressed to one node.
#[derive(Debug, Clone, Copy)]
pub struct UpdateMessageBuilder {
    target: u8,
}

impl UpdateMessageBuilder {
    pub fn new(target: u8) -> Self {
        Self { target }
    }

    /// Builds a START_REQUEST. The footer is sent as-is apart from its load address,
    /// which is replaced by `destination`.
    pub fn start_request(self, footer: &ImageFooter, destination: u32) -> UpdateMessage<'static> {
        let mut footer = *footer;
        footer.load_addr = destination;
        UpdateMessage::StartRequest {
            target: self.target,
            footer,
            destination,
        }
    }

    pub fn start_ack(self) -> UpdateMessage<'static> {
        UpdateMessage::StartAck { target: self.target }
    }

    pub fn start_nack(self, reason: NackReason) -> UpdateMessage<'static> {
        UpdateMessage::StartNack { target: self.target, reason }
    }

    pub fn data_packet(self, sequence: u32, chunk: &[u8]) -> UpdateMessage<'_> {
        UpdateMessage::DataPacket {
            target: self.target,
            sequence,
            chunk,
        }
    }

    pub fn data_ack(self, sequence: u32) -> UpdateMessage<'static> {
        UpdateMessage::DataAck { target: self.target, sequence }
    }

    pub fn data_nack(self, reason: NackReason) -> UpdateMessage<'static> {
        UpdateMessage::DataNack { target: self.target, reason }
    }

    pub fn finish_request(self, crc32: u32) -> UpdateMessage<'static> {
        UpdateMessage::FinishRequest { target: self.target, crc32 }
    }

    pub fn finish_ack(self) -> UpdateMessage<'static> {
        UpdateMessage::FinishAck { target: self.target }
    }

    pub fn finish_nack(self, reason: NackReason) -> UpdateMessage<'static> {
        UpdateMessage::FinishNack { target: self.target, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_overrides_load_address() {
        let footer = ImageFooter {
            size: 10,
            crc32: 1,
            version: 2,
            write_addr: 3,
            load_addr: 0x0800_0000,
        };
        match UpdateMessageBuilder::new(12).start_request(&footer, 0x90F0_0000) {
            UpdateMessage::StartRequest { target, footer, destination } => {
                assert_eq!(target, 12);
                assert_eq!(destination, 0x90F0_0000);
                assert_eq!(footer.load_addr, 0x90F0_0000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
