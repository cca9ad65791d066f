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

//! RAM-backed NOR flash, used by the simulator and by tests.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash, check_erase, check_read, check_write,
};

const WRITE_LOG_LEN: usize = 64;

/// NOR flash over a borrowed byte buffer.
///
/// Writes can only clear bits, as on real parts, so programming a location twice
/// without an erase in between shows up as corrupted data rather than silently
/// succeeding. Faults can be injected through the public fields.
pub struct MemFlash<'a, const ERASE_SIZE: usize = 4096, const WRITE_SIZE: usize = 1> {
    mem: &'a mut [u8],
    /// Every erase fails with `Other`
    pub fail_erase: bool,
    /// Any write touching this offset or beyond fails with `Other`
    pub fail_write_from: Option<u32>,
    pub erase_count: usize,
    pub write_count: usize,
    /// `(offset, len)` of the first writes, oldest first
    pub write_log: heapless::Vec<(u32, usize), WRITE_LOG_LEN>,
}

impl<'a, const ERASE_SIZE: usize, const WRITE_SIZE: usize> MemFlash<'a, ERASE_SIZE, WRITE_SIZE> {
    /// Wraps `mem` as is. Use [`MemFlash::erased`] for a blank part.
    pub fn new(mem: &'a mut [u8]) -> Self {
        Self {
            mem,
            fail_erase: false,
            fail_write_from: None,
            erase_count: 0,
            write_count: 0,
            write_log: heapless::Vec::new(),
        }
    }

    pub fn erased(mem: &'a mut [u8]) -> Self {
        mem.fill(0xFF);
        Self::new(mem)
    }

    pub fn contents(&self) -> &[u8] {
        self.mem
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        self.mem
    }
}

impl<const ERASE_SIZE: usize, const WRITE_SIZE: usize> ErrorType
    for MemFlash<'_, ERASE_SIZE, WRITE_SIZE>
{
    type Error = NorFlashErrorKind;
}

impl<const ERASE_SIZE: usize, const WRITE_SIZE: usize> ReadNorFlash
    for MemFlash<'_, ERASE_SIZE, WRITE_SIZE>
{
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.mem[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl<const ERASE_SIZE: usize, const WRITE_SIZE: usize> NorFlash
    for MemFlash<'_, ERASE_SIZE, WRITE_SIZE>
{
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        if self.fail_erase {
            return Err(NorFlashErrorKind::Other);
        }
        self.erase_count += 1;
        self.mem[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        if let Some(limit) = self.fail_write_from {
            if offset as usize + bytes.len() > limit as usize {
                return Err(NorFlashErrorKind::Other);
            }
        }
        self.write_count += 1;
        let _ = self.write_log.push((offset, bytes.len()));

        let start = offset as usize;
        for (cell, value) in self.mem[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_clear_bits() {
        let mut mem = [0u8; 8192];
        let mut flash = MemFlash::<4096, 1>::erased(&mut mem);

        flash.write(0, &[0xF0]).unwrap();
        flash.write(0, &[0x0F]).unwrap();
        assert_eq!(flash.contents()[0], 0x00);

        flash.erase(0, 4096).unwrap();
        assert_eq!(flash.contents()[0], 0xFF);
        assert_eq!(flash.erase_count, 1);
    }

    #[test]
    fn misaligned_operations_are_rejected() {
        let mut mem = [0u8; 8192];
        let mut flash = MemFlash::<4096, 4>::erased(&mut mem);

        assert_eq!(flash.erase(1, 4096), Err(NorFlashErrorKind::NotAligned));
        assert_eq!(flash.write(2, &[0; 4]), Err(NorFlashErrorKind::NotAligned));
        assert_eq!(flash.write(8188, &[0; 8]), Err(NorFlashErrorKind::OutOfBounds));
    }

    #[test]
    fn injected_faults_surface_as_other() {
        let mut mem = [0u8; 8192];
        let mut flash = MemFlash::<4096, 1>::erased(&mut mem);
        flash.fail_write_from = Some(100);

        assert!(flash.write(0, &[0u8; 100]).is_ok());
        assert_eq!(flash.write(64, &[0u8; 64]), Err(NorFlashErrorKind::Other));

        flash.fail_erase = true;
        assert_eq!(flash.erase(0, 4096), Err(NorFlashErrorKind::Other));
        assert_eq!(flash.contents()[0], 0x00);
    }
}
