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

use crate::source::{ImageSource, SourceError};

const READ_BLOCK_SIZE: usize = 1024;

/// Calculates the CRC of the first `len` bytes of a source
pub(crate) fn calculate_source_crc<S: ImageSource + ?Sized>(
    source: &mut S,
    len: u32,
    coverage: CrcCoverage,
) -> Result<u32, SourceError> {
    let mut crc = ImageCrc::new(coverage);
    let mut buffer = [0u8; READ_BLOCK_SIZE];

    let mut offset = 0u32;
    while offset < len {
        let want = ((len - offset) as usize).min(READ_BLOCK_SIZE);
        let got = source.read_at(offset, &mut buffer[..want])?;
        if got == 0 {
            return Err(SourceError::OutOfRange);
        }
        crc.update(&buffer[..got]);
        offset += got as u32;
    }
    Ok(crc.finalize())
}
