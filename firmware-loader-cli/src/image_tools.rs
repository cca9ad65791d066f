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

//! Preparing images on the host: footers for firmware, slot images for raw blobs.

use crate::util::{self, CommandLine};
use busupdate_host_core::source::FW_SLOT_SIZE;
use busupdate_messages::footer::{IMAGE_FOOTER_LEN, IMAGE_INFO_OFFSET, RAW_BLOB_DATA_OFFSET};
use busupdate_messages::{CrcCoverage, ImageCrc, ImageFooter, RawBlobFooter};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;

/// Write a footer describing `image` into its info window.
pub(crate) fn stamp_footer(
    image: &mut [u8],
    version: u32,
    write_addr: u32,
    load_addr: u32,
) -> IoResult<ImageFooter> {
    let window_end = IMAGE_INFO_OFFSET as usize + IMAGE_FOOTER_LEN;
    if image.len() <= window_end {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("Image of {} bytes does not reach past its footer at 0x{:x}", image.len(), IMAGE_INFO_OFFSET),
        ));
    }
    let size = u32::try_from(image.len())
        .ok()
        .filter(|&size| size <= FW_SLOT_SIZE)
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "Image is larger than a firmware slot"))?;

    let footer = ImageFooter {
        size,
        crc32: ImageCrc::checksum(CrcCoverage::Firmware, image),
        version,
        write_addr,
        load_addr,
    };
    image[IMAGE_INFO_OFFSET as usize..window_end].copy_from_slice(&footer.to_bytes());
    Ok(footer)
}

/// Slot image holding `data`: footer at the start, erased padding, data at the data offset.
pub(crate) fn pack_blob(name: &str, data: &[u8]) -> IoResult<Vec<u8>> {
    let capacity = (FW_SLOT_SIZE - RAW_BLOB_DATA_OFFSET) as usize;
    if data.is_empty() || data.len() > capacity {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("Blob must be between 1 and {} bytes, got {}", capacity, data.len()),
        ));
    }

    let footer = RawBlobFooter::new(name, data.len() as u32, ImageCrc::checksum(CrcCoverage::Raw, data));
    let mut slot = vec![0xFF; RAW_BLOB_DATA_OFFSET as usize];
    slot[..footer.to_bytes().len()].copy_from_slice(&footer.to_bytes());
    slot.extend_from_slice(data);
    Ok(slot)
}

pub(crate) fn stamp(command_line: &CommandLine) -> IoResult<()> {
    let path = command_line.input()?;
    let version = command_line.required_number("version")?;
    let write_addr = command_line.required_number("write-addr")?;
    let load_addr = command_line.number("load-addr")?.unwrap_or(write_addr);
    let out = command_line.option("out").unwrap_or(path);

    let mut image = util::read_binary_file(path)?;
    let footer = stamp_footer(&mut image, version, write_addr, load_addr)?;
    util::write_binary_file(out, &image)?;

    log::info!(
        "Stamped {}: {} bytes, version {}, CRC 0x{:08x}",
        out,
        footer.size,
        footer.version,
        footer.crc32
    );
    Ok(())
}

pub(crate) fn pack(command_line: &CommandLine) -> IoResult<()> {
    let path = command_line.input()?;
    let out = command_line
        .option("out")
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "--out is required"))?;

    let data = util::read_binary_file(path)?;
    let slot = pack_blob(util::file_name(Path::new(path))?, &data)?;
    util::write_binary_file(out, &slot)?;

    log::info!("Packed {} bytes of {} into {}", data.len(), path, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamped_footer_carries_crc_of_its_own_image() {
        let mut image: Vec<u8> = (0..0x2100).map(|i| (i % 199) as u8).collect();
        let footer = stamp_footer(&mut image, 9, 0x0800_0000, 0x0800_0000).unwrap();

        let at = IMAGE_INFO_OFFSET as usize;
        let embedded = ImageFooter::from_bytes(&image[at..at + IMAGE_FOOTER_LEN]).unwrap();
        assert_eq!(embedded, footer);
        assert_eq!(embedded.size, 0x2100);
        assert_eq!(embedded.crc32, ImageCrc::checksum(CrcCoverage::Firmware, &image));
        assert_eq!(embedded.validate(FW_SLOT_SIZE), Ok(()));
    }

    #[test]
    fn image_must_reach_past_footer_window() {
        let mut image = vec![0u8; IMAGE_INFO_OFFSET as usize + IMAGE_FOOTER_LEN];
        assert!(stamp_footer(&mut image, 1, 0, 0).is_err());
    }

    #[test]
    fn packed_blob_reads_back_as_valid_slot() {
        let data = vec![0x3Cu8; 700];
        let slot = pack_blob("gamma.lut", &data).unwrap();

        let footer = RawBlobFooter::from_bytes(&slot).unwrap();
        assert!(footer.is_valid());
        assert_eq!(footer.filename(), "gamma.lut");
        assert_eq!(footer.size, 700);
        assert_eq!(footer.crc32, ImageCrc::checksum(CrcCoverage::Raw, &data));
        assert_eq!(&slot[RAW_BLOB_DATA_OFFSET as usize..], &data[..]);
        assert!(slot[64..RAW_BLOB_DATA_OFFSET as usize].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn empty_blob_is_refused() {
        assert!(pack_blob("empty", &[]).is_err());
    }
}
