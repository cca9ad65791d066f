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

mod util;

pub mod config;
pub mod coordinator;
pub mod link;
pub mod session;
pub mod source;

pub use crate::config::CoordinatorConfig;
pub use crate::coordinator::{Coordinator, DEFAULT_MAX_SESSIONS, Outbound, StartSessionError};
pub use crate::link::{FrameAccumulator, LinkError, QueueTransport, Transport, pump};
pub use crate::session::{SessionInfo, SessionState};
pub use crate::source::{
    DirectoryStore, ImageSource, MemoryStore, SlotStore, SourceError, SourceKind, SourceStore,
};

pub use busupdate_messages::{FrameError, NackReason};
