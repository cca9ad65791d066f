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

//! Update sub-protocol carried in [`crate::FIRMWARE_UPDATE_MSG_TYPE`] messages.
//!
//! Every payload starts with `[sub-command][target address]`. The target address is
//! the node being updated, in both directions.

pub mod builder;

use crate::footer::{IMAGE_FOOTER_LEN, ImageFooter, read_u32};
use strum::{FromRepr, IntoStaticStr};

/// Largest chunk carried by one DATA_PACKET.
pub const MAX_CHUNK_SIZE: usize = 256;

const HEADER_LEN: usize = 2;
const START_REQUEST_LEN: usize = HEADER_LEN + IMAGE_FOOTER_LEN;
const DATA_HEADER_LEN: usize = HEADER_LEN + 4;

pub const MAX_UPDATE_MESSAGE_LEN: usize = DATA_HEADER_LEN + MAX_CHUNK_SIZE;

pub type EncodedMessage = heapless::Vec<u8, MAX_UPDATE_MESSAGE_LEN>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum SubCommand {
    StartRequest = 0x01,
    StartAck = 0x02,
    StartNack = 0x03,
    DataPacket = 0x10,
    DataAck = 0x11,
    DataNack = 0x12,
    FinishRequest = 0x20,
    FinishAck = 0x21,
    FinishNack = 0x22,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr, IntoStaticStr, strum::Display)]
pub enum NackReason {
    #[default]
    #[strum(serialize = "No error")]
    None = 0,
    #[strum(serialize = "Error: File too large")]
    FileTooLarge = 1,
    #[strum(serialize = "Error: Version")]
    InvalidVersion = 2,
    #[strum(serialize = "Error: Erasing")]
    EraseFailed = 3,
    #[strum(serialize = "Error: Write")]
    WriteFailed = 4,
    #[strum(serialize = "Error: CRC")]
    CrcMismatch = 5,
    #[strum(serialize = "Error: Packet")]
    UnexpectedPacket = 6,
    #[strum(serialize = "Error: Size")]
    SizeMismatch = 7,
    #[strum(serialize = "Error: Client Timeout")]
    ServerTimeout = 8,
    #[strum(serialize = "Error: Source read")]
    InternalError = 9,
}

impl NackReason {
    pub fn as_text(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Empty,
    Truncated(SubCommand),
    UnknownSubCommand(u8),
    UnknownReason(u8),
    EmptyChunk,
    ChunkTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Value is the number of bytes the message needs
    BufferTooSmall(usize),
    ChunkTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMessage<'a> {
    /// `footer.load_addr` is ignored when encoding; `destination` takes its place.
    StartRequest { target: u8, footer: ImageFooter, destination: u32 },
    StartAck { target: u8 },
    StartNack { target: u8, reason: NackReason },
    DataPacket { target: u8, sequence: u32, chunk: &'a [u8] },
    DataAck { target: u8, sequence: u32 },
    DataNack { target: u8, reason: NackReason },
    FinishRequest { target: u8, crc32: u32 },
    FinishAck { target: u8 },
    FinishNack { target: u8, reason: NackReason },
}

impl<'a> UpdateMessage<'a> {
    pub fn sub_command(&self) -> SubCommand {
        match self {
            UpdateMessage::StartRequest { .. } => SubCommand::StartRequest,
            UpdateMessage::StartAck { .. } => SubCommand::StartAck,
            UpdateMessage::StartNack { .. } => SubCommand::StartNack,
            UpdateMessage::DataPacket { .. } => SubCommand::DataPacket,
            UpdateMessage::DataAck { .. } => SubCommand::DataAck,
            UpdateMessage::DataNack { .. } => SubCommand::DataNack,
            UpdateMessage::FinishRequest { .. } => SubCommand::FinishRequest,
            UpdateMessage::FinishAck { .. } => SubCommand::FinishAck,
            UpdateMessage::FinishNack { .. } => SubCommand::FinishNack,
        }
    }

    pub fn target(&self) -> u8 {
        match *self {
            UpdateMessage::StartRequest { target, .. }
            | UpdateMessage::StartAck { target }
            | UpdateMessage::StartNack { target, .. }
            | UpdateMessage::DataPacket { target, .. }
            | UpdateMessage::DataAck { target, .. }
            | UpdateMessage::DataNack { target, .. }
            | UpdateMessage::FinishRequest { target, .. }
            | UpdateMessage::FinishAck { target }
            | UpdateMessage::FinishNack { target, .. } => target,
        }
    }

    /// Decode a payload. Every field access is preceded by a length check; bytes past
    /// the end of a fixed-size message are ignored.
    pub fn decode(payload: &'a [u8]) -> Result<Self, DecodeError> {
        let (&code, rest) = payload.split_first().ok_or(DecodeError::Empty)?;
        let sub_command = SubCommand::from_repr(code).ok_or(DecodeError::UnknownSubCommand(code))?;
        let &target = rest.first().ok_or(DecodeError::Truncated(sub_command))?;

        let require = |len: usize| {
            if payload.len() < len {
                Err(DecodeError::Truncated(sub_command))
            } else {
                Ok(())
            }
        };
        let reason = || -> Result<NackReason, DecodeError> {
            require(HEADER_LEN + 1)?;
            let code = payload[HEADER_LEN];
            NackReason::from_repr(code).ok_or(DecodeError::UnknownReason(code))
        };

        let message = match sub_command {
            SubCommand::StartRequest => {
                require(START_REQUEST_LEN)?;
                let footer = ImageFooter::from_bytes(&payload[HEADER_LEN..START_REQUEST_LEN])
                    .map_err(|_| DecodeError::Truncated(sub_command))?;
                // The trailing address field sits in the footer's load address slot.
                let destination = footer.load_addr;
                UpdateMessage::StartRequest { target, footer, destination }
            }
            SubCommand::StartAck => UpdateMessage::StartAck { target },
            SubCommand::StartNack => UpdateMessage::StartNack { target, reason: reason()? },
            SubCommand::DataPacket => {
                require(DATA_HEADER_LEN)?;
                let chunk = &payload[DATA_HEADER_LEN..];
                if chunk.is_empty() {
                    return Err(DecodeError::EmptyChunk);
                }
                if chunk.len() > MAX_CHUNK_SIZE {
                    return Err(DecodeError::ChunkTooLarge(chunk.len()));
                }
                UpdateMessage::DataPacket {
                    target,
                    sequence: read_u32(payload, HEADER_LEN),
                    chunk,
                }
            }
            SubCommand::DataAck => {
                require(DATA_HEADER_LEN)?;
                UpdateMessage::DataAck { target, sequence: read_u32(payload, HEADER_LEN) }
            }
            SubCommand::DataNack => UpdateMessage::DataNack { target, reason: reason()? },
            SubCommand::FinishRequest => {
                require(HEADER_LEN + 4)?;
                UpdateMessage::FinishRequest { target, crc32: read_u32(payload, HEADER_LEN) }
            }
            SubCommand::FinishAck => UpdateMessage::FinishAck { target },
            SubCommand::FinishNack => UpdateMessage::FinishNack { target, reason: reason()? },
        };
        Ok(message)
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            UpdateMessage::StartRequest { .. } => START_REQUEST_LEN,
            UpdateMessage::StartAck { .. } | UpdateMessage::FinishAck { .. } => HEADER_LEN,
            UpdateMessage::StartNack { .. }
            | UpdateMessage::DataNack { .. }
            | UpdateMessage::FinishNack { .. } => HEADER_LEN + 1,
            UpdateMessage::DataPacket { chunk, .. } => DATA_HEADER_LEN + chunk.len(),
            UpdateMessage::DataAck { .. } | UpdateMessage::FinishRequest { .. } => HEADER_LEN + 4,
        }
    }

    /// Encode into `buffer`, returning the number of bytes written.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize, EncodeError> {
        if let UpdateMessage::DataPacket { chunk, .. } = self {
            if chunk.len() > MAX_CHUNK_SIZE {
                return Err(EncodeError::ChunkTooLarge(chunk.len()));
            }
        }
        let len = self.encoded_len();
        if buffer.len() < len {
            return Err(EncodeError::BufferTooSmall(len));
        }

        buffer[0] = self.sub_command() as u8;
        buffer[1] = self.target();
        match *self {
            UpdateMessage::StartRequest { footer, destination, .. } => {
                let footer_bytes = footer.to_bytes();
                buffer[HEADER_LEN..HEADER_LEN + 16].copy_from_slice(&footer_bytes[..16]);
                buffer[HEADER_LEN + 16..START_REQUEST_LEN].copy_from_slice(&destination.to_le_bytes());
            }
            UpdateMessage::StartNack { reason, .. }
            | UpdateMessage::DataNack { reason, .. }
            | UpdateMessage::FinishNack { reason, .. } => {
                buffer[HEADER_LEN] = reason as u8;
            }
            UpdateMessage::DataPacket { sequence, chunk, .. } => {
                buffer[HEADER_LEN..DATA_HEADER_LEN].copy_from_slice(&sequence.to_le_bytes());
                buffer[DATA_HEADER_LEN..len].copy_from_slice(chunk);
            }
            UpdateMessage::DataAck { sequence, .. } => {
                buffer[HEADER_LEN..DATA_HEADER_LEN].copy_from_slice(&sequence.to_le_bytes());
            }
            UpdateMessage::FinishRequest { crc32, .. } => {
                buffer[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&crc32.to_le_bytes());
            }
            UpdateMessage::StartAck { .. } | UpdateMessage::FinishAck { .. } => {}
        }
        Ok(len)
    }

    pub fn to_vec(&self) -> Result<EncodedMessage, EncodeError> {
        let mut buffer = [0u8; MAX_UPDATE_MESSAGE_LEN];
        let len = self.encode(&mut buffer)?;
        let mut encoded = EncodedMessage::new();
        encoded
            .extend_from_slice(&buffer[..len])
            .map_err(|_| EncodeError::BufferTooSmall(len))?;
        Ok(encoded)
    }
}
