#![no_std]
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

use minicbor::{CborLen, Decode, Encode};

pub mod crc;
pub mod footer;
pub mod update;

pub use crate::crc::{CrcCoverage, ImageCrc};
pub use crate::footer::{FooterError, ImageFooter, RawBlobFooter};
pub use crate::update::builder::UpdateMessageBuilder;
pub use crate::update::{NackReason, SubCommand, UpdateMessage};

/// Transport message type reserved for every update sub-command.
pub const FIRMWARE_UPDATE_MSG_TYPE: u8 = 0xC1;

/// One typed message as carried between a host and a bus bridge.
///
/// The payload is opaque to the envelope; for [`FIRMWARE_UPDATE_MSG_TYPE`] it holds an
/// encoded [`UpdateMessage`].
#[derive(Debug, PartialEq, Decode, Encode, CborLen)]
pub struct BusFrame<'b> {
    #[n(0)] pub msg_type: u8,
    #[b(1)]
    #[cbor(with = "minicbor::bytes")]
    pub payload: &'b [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer is too small to hold the encoded message and length prefix, value is the expected length
    BufferTooSmall(usize),
    /// The CBOR encoding failed due to invalid data
    EncodingError,
    DecodingError,
}

const PREFIX_BYTE_COUNT: usize = 2;

/// Frame a CBOR message with a length prefix for sending across a data link.
///
/// Returns the number of bytes written on success, or a FrameError on failure.
///
/// # Errors
///
/// - `BufferTooSmall`: if the buffer is not large enough to hold the length prefix (2 bytes)
///   plus the encoded message
/// - `EncodingError`: if the CBOR encoding of the message failed
pub fn frame_message<M>(msg: &M, buffer: &mut [u8]) -> Result<usize, FrameError>
where
    M: minicbor::Encode<()> + minicbor::CborLen<()>,
{
    let encoded_len = minicbor::len(msg);
    let total_bytes_needed = encoded_len + PREFIX_BYTE_COUNT;

    if encoded_len > u16::MAX as usize {
        return Err(FrameError::EncodingError);
    }

    if buffer.len() < total_bytes_needed {
        return Err(FrameError::BufferTooSmall(total_bytes_needed));
    }

    buffer[0..PREFIX_BYTE_COUNT].copy_from_slice(&(encoded_len as u16).to_be_bytes());

    minicbor::encode(msg, &mut buffer[PREFIX_BYTE_COUNT..total_bytes_needed])
        .map_err(|_| FrameError::EncodingError)?;

    Ok(total_bytes_needed)
}

/// Decode one length-prefixed CBOR message from the front of `buffer`.
///
/// Returns the number of bytes consumed together with the message. A `BufferTooSmall`
/// error means more bytes are needed before the frame is complete.
pub fn decode_framed_message<'b, M>(
    buffer: &'b [u8],
) -> Result<(usize, M), FrameError>
where
    M: minicbor::Decode<'b, ()>,
{
    if buffer.len() < PREFIX_BYTE_COUNT {
        return Err(FrameError::BufferTooSmall(PREFIX_BYTE_COUNT));
    }

    let mut length_bytes = [0u8; PREFIX_BYTE_COUNT];
    length_bytes.copy_from_slice(&buffer[..PREFIX_BYTE_COUNT]);
    let message_len = u16::from_be_bytes(length_bytes) as usize;

    let message_end = PREFIX_BYTE_COUNT + message_len;
    if buffer.len() < message_end {
        return Err(FrameError::BufferTooSmall(message_end));
    }

    let message = minicbor::decode::<M>(&buffer[PREFIX_BYTE_COUNT..message_end])
        .map_err(|_| FrameError::DecodingError)?;

    Ok((message_end, message))
}
