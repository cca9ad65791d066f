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

//! Receiving side of the bus update protocol.
//!
//! A node owns one [`TargetAgent`]. The firmware glue hands it every payload of
//! [`busupdate_messages::FIRMWARE_UPDATE_MSG_TYPE`] together with the current tick,
//! sends back whatever reply it produces, and carries out any [`AgentAction`].
//! [`TargetAgent::service`] must be called periodically so abandoned transfers are
//! discarded.

pub mod agent;
pub mod config;
pub mod flash;
pub mod policy;

#[cfg(any(test, feature = "mem-flash"))]
pub mod mem_flash;

pub use crate::agent::{AgentAction, AgentOutput, AgentState, AgentStatus, TargetAgent, Transfer};
pub use crate::config::{AgentConfig, FirmwareRegion};
pub use crate::flash::{FlashError, PagedFlash};
pub use crate::policy::{StrictlyNewer, VersionPolicy};
