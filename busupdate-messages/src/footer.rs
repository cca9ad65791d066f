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

//! Image metadata blocks.
//!
//! All fields are little-endian, matching the layout the nodes keep in flash.

/// Offset of the [`ImageFooter`] inside a firmware image.
pub const IMAGE_INFO_OFFSET: u32 = 0x2000;
pub const IMAGE_FOOTER_LEN: usize = 20;

pub const RAW_BLOB_MAGIC: u32 = 0xDEAD_BEEF;
pub const RAW_BLOB_FOOTER_LEN: usize = 64;
pub const RAW_BLOB_FILENAME_LEN: usize = 48;
/// Raw blob data starts after the first 4K sector of its slot.
pub const RAW_BLOB_DATA_OFFSET: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FooterError {
    Truncated,
    ZeroSize,
    TooLarge,
    BadMagic,
    NotValid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageFooter {
    pub size: u32,
    pub crc32: u32,
    pub version: u32,
    pub write_addr: u32,
    pub load_addr: u32,
}

impl ImageFooter {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FooterError> {
        if bytes.len() < IMAGE_FOOTER_LEN {
            return Err(FooterError::Truncated);
        }
        Ok(Self {
            size: read_u32(bytes, 0),
            crc32: read_u32(bytes, 4),
            version: read_u32(bytes, 8),
            write_addr: read_u32(bytes, 12),
            load_addr: read_u32(bytes, 16),
        })
    }

    pub fn to_bytes(&self) -> [u8; IMAGE_FOOTER_LEN] {
        let mut bytes = [0u8; IMAGE_FOOTER_LEN];
        bytes[0..4].copy_from_slice(&self.size.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.write_addr.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.load_addr.to_le_bytes());
        bytes
    }

    /// Footer of a firmware image: non-empty, fits in `max_size`, and long enough to
    /// contain its own footer window.
    pub fn validate(&self, max_size: u32) -> Result<(), FooterError> {
        if self.size == 0 {
            return Err(FooterError::ZeroSize);
        }
        if self.size > max_size {
            return Err(FooterError::TooLarge);
        }
        if self.size < IMAGE_INFO_OFFSET + IMAGE_FOOTER_LEN as u32 {
            return Err(FooterError::Truncated);
        }
        Ok(())
    }

    /// An erased footer, as found in a region that never held an image.
    pub fn is_blank(&self) -> bool {
        self.size == u32::MAX && self.crc32 == u32::MAX && self.version == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlobFooter {
    pub magic: u32,
    pub size: u32,
    pub crc32: u32,
    pub filename: [u8; RAW_BLOB_FILENAME_LEN],
    pub valid: u8,
}

impl RawBlobFooter {
    /// A completed upload of `size` bytes named `filename` (truncated to fit).
    pub fn new(filename: &str, size: u32, crc32: u32) -> Self {
        let mut name = [0u8; RAW_BLOB_FILENAME_LEN];
        // Keep one NUL so the name always terminates.
        let len = filename.len().min(RAW_BLOB_FILENAME_LEN - 1);
        name[..len].copy_from_slice(&filename.as_bytes()[..len]);
        Self {
            magic: RAW_BLOB_MAGIC,
            size,
            crc32,
            filename: name,
            valid: 1,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FooterError> {
        if bytes.len() < RAW_BLOB_FOOTER_LEN {
            return Err(FooterError::Truncated);
        }
        let mut filename = [0u8; RAW_BLOB_FILENAME_LEN];
        filename.copy_from_slice(&bytes[12..12 + RAW_BLOB_FILENAME_LEN]);
        Ok(Self {
            magic: read_u32(bytes, 0),
            size: read_u32(bytes, 4),
            crc32: read_u32(bytes, 8),
            filename,
            valid: bytes[12 + RAW_BLOB_FILENAME_LEN],
        })
    }

    pub fn to_bytes(&self) -> [u8; RAW_BLOB_FOOTER_LEN] {
        let mut bytes = [0u8; RAW_BLOB_FOOTER_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        bytes[12..12 + RAW_BLOB_FILENAME_LEN].copy_from_slice(&self.filename);
        bytes[12 + RAW_BLOB_FILENAME_LEN] = self.valid;
        bytes
    }

    pub fn check(&self) -> Result<(), FooterError> {
        if self.magic != RAW_BLOB_MAGIC {
            return Err(FooterError::BadMagic);
        }
        if self.valid != 1 {
            return Err(FooterError::NotValid);
        }
        if self.size == 0 {
            return Err(FooterError::ZeroSize);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    pub fn filename(&self) -> &str {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(RAW_BLOB_FILENAME_LEN);
        core::str::from_utf8(&self.filename[..end]).unwrap_or("")
    }

    /// Raw blobs have no version; addresses are supplied by the coordinator.
    pub fn to_image_footer(&self) -> ImageFooter {
        ImageFooter {
            size: self.size,
            crc32: self.crc32,
            version: 0,
            write_addr: 0,
            load_addr: 0,
        }
    }
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}
