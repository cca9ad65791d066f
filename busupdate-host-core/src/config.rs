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

use busupdate_messages::update::MAX_CHUNK_SIZE;
use embassy_time::Duration;

/// Tunables for the coordinator. The phase timeouts differ because the agent erases the
/// whole destination before acknowledging START and checksums it before acknowledging
/// FINISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Data bytes per DATA_PACKET, at most [`MAX_CHUNK_SIZE`]
    pub chunk_size: usize,
    /// Resends allowed per request before the session fails
    pub retry_budget: u32,
    pub start_ack_timeout: Duration,
    pub data_ack_timeout: Duration,
    pub finish_ack_timeout: Duration,
    pub max_image_size: u32,
    /// Recompute the CRC of firmware and raw slot sources before starting
    pub verify_source_crc: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            retry_budget: 10,
            start_ack_timeout: Duration::from_millis(6000),
            data_ack_timeout: Duration::from_millis(200),
            finish_ack_timeout: Duration::from_millis(10000),
            max_image_size: 1024 * 1024,
            verify_source_crc: true,
        }
    }
}

impl CoordinatorConfig {
    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_CHUNK_SIZE)
    }
}
