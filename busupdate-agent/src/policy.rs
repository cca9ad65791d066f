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

use busupdate_messages::ImageFooter;

/// Decides whether an offered firmware image may replace the installed one.
pub trait VersionPolicy {
    /// `installed` is `None` when the firmware region holds no readable footer.
    fn is_newer(&self, installed: Option<&ImageFooter>, candidate: &ImageFooter) -> bool;
}

/// Accepts only a strictly higher version number.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictlyNewer;

impl VersionPolicy for StrictlyNewer {
    fn is_newer(&self, installed: Option<&ImageFooter>, candidate: &ImageFooter) -> bool {
        match installed {
            None => true,
            Some(installed) => candidate.version > installed.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn footer(version: u32) -> ImageFooter {
        ImageFooter { size: 1, version, ..Default::default() }
    }

    #[test]
    fn strictly_newer_rejects_same_and_older_versions() {
        let policy = StrictlyNewer;
        assert!(policy.is_newer(None, &footer(1)));
        assert!(policy.is_newer(Some(&footer(4)), &footer(5)));
        assert!(!policy.is_newer(Some(&footer(5)), &footer(5)));
        assert!(!policy.is_newer(Some(&footer(6)), &footer(5)));
    }
}
