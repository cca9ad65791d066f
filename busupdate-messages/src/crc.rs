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

//! Image CRC shared by both ends of a transfer.
//!
//! The nodes verify images with the STM32 CRC peripheral fed one byte per 32-bit
//! word. That is CRC-32/MPEG-2 run over `[0, 0, 0, b]` for every image byte `b`.

use crate::footer::{IMAGE_FOOTER_LEN, IMAGE_INFO_OFFSET};
use crc::{CRC_32_MPEG_2, Crc, Digest};

static STM32_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

const FOOTER_WINDOW_START: u32 = IMAGE_INFO_OFFSET;
const FOOTER_WINDOW_END: u32 = IMAGE_INFO_OFFSET + IMAGE_FOOTER_LEN as u32;

/// Which bytes of an image take part in its CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcCoverage {
    /// Firmware images carry their own footer. The footer window is read as erased
    /// flash so the stored CRC does not depend on itself.
    Firmware,
    /// Every byte counts.
    Raw,
}

pub struct ImageCrc {
    digest: Digest<'static, u32>,
    coverage: CrcCoverage,
    position: u32,
}

impl ImageCrc {
    pub fn new(coverage: CrcCoverage) -> Self {
        Self {
            digest: STM32_CRC.digest(),
            coverage,
            position: 0,
        }
    }

    pub fn checksum(coverage: CrcCoverage, data: &[u8]) -> u32 {
        let mut crc = Self::new(coverage);
        crc.update(data);
        crc.finalize()
    }

    /// Feed the next bytes of the image, in order.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let byte = if self.in_footer_window() { 0xFF } else { byte };
            self.digest.update(&[0, 0, 0, byte]);
            self.position = self.position.wrapping_add(1);
        }
    }

    /// Number of image bytes consumed so far.
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }

    fn in_footer_window(&self) -> bool {
        self.coverage == CrcCoverage::Firmware
            && (FOOTER_WINDOW_START..FOOTER_WINDOW_END).contains(&self.position)
    }
}
