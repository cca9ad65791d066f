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

use embassy_time::Duration;

/// A transfer with no traffic for this long is abandoned.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_millis(5000);
/// Gives the FINISH_ACK time to leave the bus before the node resets.
pub const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(100);

/// Where the running firmware lives. A transfer to exactly this address is a firmware
/// update; anything else is a passive data blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRegion {
    pub address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConfig {
    /// Bus address of this node
    pub node_address: u8,
    /// Bus address of offset 0 of the flash driver
    pub flash_base: u32,
    pub firmware: FirmwareRegion,
    pub inactivity_timeout: Duration,
    pub reset_delay: Duration,
}

impl AgentConfig {
    pub fn new(node_address: u8, flash_base: u32, firmware: FirmwareRegion) -> Self {
        Self {
            node_address,
            flash_base,
            firmware,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            reset_delay: DEFAULT_RESET_DELAY,
        }
    }

    pub fn is_firmware_destination(&self, destination: u32) -> bool {
        destination == self.firmware.address
    }
}
