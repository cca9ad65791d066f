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

use busupdate_messages::{CrcCoverage, ImageCrc};
use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

/// Program granularity of the external parts this was written for.
pub const DEFAULT_PAGE_SIZE: usize = 256;

const READ_CHUNK_SIZE: usize = 128;
const MAX_WRITE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Range falls outside the part
    OutOfBounds,
    /// Write does not start on a program unit boundary
    Unaligned,
    Driver(NorFlashErrorKind),
}

fn driver_error<E: NorFlashError>(error: E) -> FlashError {
    FlashError::Driver(error.kind())
}

/// Erase and program discipline on top of a [`NorFlash`] driver.
///
/// Callers work in bus addresses; `base` is the bus address of driver offset 0.
/// Writes are split so no single program operation crosses a `PAGE_SIZE` boundary,
/// and erases are widened to whole erase blocks.
pub struct PagedFlash<F, const PAGE_SIZE: usize = DEFAULT_PAGE_SIZE> {
    flash: F,
    base: u32,
}

impl<F: NorFlash, const PAGE_SIZE: usize> PagedFlash<F, PAGE_SIZE> {
    pub fn new(flash: F, base: u32) -> Self {
        Self { flash, base }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.flash.capacity()
    }

    pub fn inner(&self) -> &F {
        &self.flash
    }

    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// True when `[address, address + len)` lies entirely on the part.
    pub fn contains(&self, address: u32, len: u32) -> bool {
        self.offset_of(address, len).is_ok()
    }

    fn offset_of(&self, address: u32, len: u32) -> Result<u32, FlashError> {
        let offset = address.checked_sub(self.base).ok_or(FlashError::OutOfBounds)?;
        let end = offset.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end as usize > self.flash.capacity() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(offset)
    }

    /// Erase every block overlapping `[address, address + len)`.
    pub fn erase_range(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        let offset = self.offset_of(address, len)?;
        let block = F::ERASE_SIZE as u32;

        let from = offset - offset % block;
        let to = (offset + len).div_ceil(block) * block;
        if to as usize > self.flash.capacity() {
            return Err(FlashError::OutOfBounds);
        }

        log::trace!("Erasing flash offsets 0x{:x}..0x{:x}", from, to);
        self.flash.erase(from, to).map_err(driver_error)
    }

    /// Program `bytes` at `address`, which must already be erased.
    ///
    /// `address` must sit on a program unit boundary. A trailing partial unit is padded
    /// with `0xFF`, so only the final write of a sequence may have an odd length.
    pub fn write(&mut self, address: u32, bytes: &[u8]) -> Result<(), FlashError> {
        let mut offset = self.offset_of(address, bytes.len() as u32)?;
        if offset as usize % F::WRITE_SIZE != 0
            || F::WRITE_SIZE > MAX_WRITE_SIZE
            || PAGE_SIZE % F::WRITE_SIZE != 0
        {
            return Err(FlashError::Unaligned);
        }

        let mut remaining = bytes;
        while !remaining.is_empty() {
            let room_in_page = PAGE_SIZE - offset as usize % PAGE_SIZE;
            let (piece, rest) = remaining.split_at(room_in_page.min(remaining.len()));
            self.program(offset, piece)?;
            offset += piece.len() as u32;
            remaining = rest;
        }
        Ok(())
    }

    fn program(&mut self, offset: u32, piece: &[u8]) -> Result<(), FlashError> {
        let whole = piece.len() - piece.len() % F::WRITE_SIZE;
        if whole > 0 {
            self.flash.write(offset, &piece[..whole]).map_err(driver_error)?;
        }

        let tail = &piece[whole..];
        if !tail.is_empty() {
            let mut unit = [0xFFu8; MAX_WRITE_SIZE];
            unit[..tail.len()].copy_from_slice(tail);
            self.flash
                .write(offset + whole as u32, &unit[..F::WRITE_SIZE])
                .map_err(driver_error)?;
        }
        Ok(())
    }

    pub fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset_of(address, buffer.len() as u32)?;
        self.flash.read(offset, buffer).map_err(driver_error)
    }

    /// CRC of `len` bytes starting at `address`, read back from the part.
    pub fn crc(&mut self, address: u32, len: u32, coverage: CrcCoverage) -> Result<u32, FlashError> {
        self.offset_of(address, len)?;

        let mut crc = ImageCrc::new(coverage);
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        let mut done = 0u32;
        while done < len {
            let step = (len - done).min(READ_CHUNK_SIZE as u32) as usize;
            self.read(address + done, &mut buffer[..step])?;
            crc.update(&buffer[..step]);
            done += step as u32;
        }
        Ok(crc.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_flash::MemFlash;

    const BASE: u32 = 0x1000_0000;

    #[test]
    fn writes_never_cross_a_page() {
        let mut mem = [0u8; 8192];
        let mut flash = PagedFlash::<_, 256>::new(MemFlash::<4096, 1>::erased(&mut mem), BASE);

        let data = [0x5Au8; 600];
        flash.write(BASE + 200, &data).unwrap();

        let log = &flash.inner().write_log;
        assert_eq!(log.as_slice(), &[(200, 56), (256, 256), (512, 256), (768, 32)]);
        for &(offset, len) in log.iter() {
            assert_eq!(offset as usize / 256, (offset as usize + len - 1) / 256);
        }
        assert!(flash.inner().contents()[200..800].iter().all(|&b| b == 0x5A));
        assert_eq!(flash.inner().contents()[800], 0xFF);
    }

    #[test]
    fn erase_widens_to_whole_blocks() {
        let mut mem = [0u8; 16384];
        let mut flash = PagedFlash::<_, 256>::new(MemFlash::<4096, 1>::new(&mut mem), BASE);

        flash.erase_range(BASE + 5000, 100).unwrap();

        let contents = flash.inner().contents();
        assert_eq!(contents[4095], 0x00);
        assert!(contents[4096..8192].iter().all(|&b| b == 0xFF));
        assert_eq!(contents[8192], 0x00);
    }

    #[test]
    fn erase_spanning_block_boundary_covers_both_blocks() {
        let mut mem = [0u8; 16384];
        let mut flash = PagedFlash::<_, 256>::new(MemFlash::<4096, 1>::new(&mut mem), BASE);

        flash.erase_range(BASE + 4000, 200).unwrap();

        let contents = flash.inner().contents();
        assert!(contents[..8192].iter().all(|&b| b == 0xFF));
        assert_eq!(contents[8192], 0x00);
    }

    #[test]
    fn partial_write_unit_is_padded() {
        let mut mem = [0u8; 8192];
        let mut flash = PagedFlash::<_, 256>::new(MemFlash::<4096, 4>::erased(&mut mem), BASE);

        flash.write(BASE, &[1, 2, 3, 4, 5, 6]).unwrap();

        assert_eq!(&flash.inner().contents()[..8], &[1, 2, 3, 4, 5, 6, 0xFF, 0xFF]);
        assert_eq!(flash.write(BASE + 6, &[7]), Err(FlashError::Unaligned));
    }

    #[test]
    fn addresses_outside_the_part_are_rejected() {
        let mut mem = [0u8; 8192];
        let mut flash = PagedFlash::<_, 256>::new(MemFlash::<4096, 1>::erased(&mut mem), BASE);

        assert_eq!(flash.write(BASE - 1, &[0]), Err(FlashError::OutOfBounds));
        assert_eq!(flash.write(BASE + 8190, &[0; 4]), Err(FlashError::OutOfBounds));
        assert_eq!(flash.erase_range(BASE + 8192, 1), Err(FlashError::OutOfBounds));
        assert!(flash.contains(BASE, 8192));
        assert!(!flash.contains(BASE, 8193));
    }

    #[test]
    fn driver_failures_are_reported() {
        let mut mem = [0u8; 8192];
        let mut inner = MemFlash::<4096, 1>::erased(&mut mem);
        inner.fail_erase = true;
        let mut flash = PagedFlash::<_, 256>::new(inner, BASE);

        assert_eq!(
            flash.erase_range(BASE, 10),
            Err(FlashError::Driver(NorFlashErrorKind::Other))
        );
    }

    #[test]
    fn crc_reads_back_what_was_written() {
        let mut mem = [0u8; 8192];
        let mut flash = PagedFlash::<_, 256>::new(MemFlash::<4096, 1>::erased(&mut mem), BASE);

        let data: [u8; 300] = core::array::from_fn(|i| i as u8);
        flash.write(BASE, &data).unwrap();

        assert_eq!(
            flash.crc(BASE, 300, CrcCoverage::Raw).unwrap(),
            ImageCrc::checksum(CrcCoverage::Raw, &data)
        );
    }
}
