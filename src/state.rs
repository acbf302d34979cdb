/*
    otavisor: an update supervisor DBUS daemon and CLI interface
    Copyright (C) 2025  Denis Benato

    This program is free software; you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation; either version 2 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License along
    with this program; if not, write to the Free Software Foundation, Inc.,
    51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.
*/

use std::path::PathBuf;

/// Last known network state, as seen by connectivity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    Unknown,
    Connected,
    NotConnected,
}

impl Connectivity {
    pub fn as_str(&self) -> &str {
        match self {
            Connectivity::Unknown => "Unknown",
            Connectivity::Connected => "Connected",
            Connectivity::NotConnected => "NotConnected",
        }
    }
}

/// Metadata of the pending update. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateInfo {
    pub version: String,
    pub headline: String,
    pub description: String,
    pub kind: String,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.version.is_empty()
            && self.headline.is_empty()
            && self.description.is_empty()
            && self.kind.is_empty()
    }
}

/// Session state of the supervisor.
///
/// Only the dispatcher mutates it; everybody else gets a clone through a
/// snapshot request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub connectivity: Connectivity,

    /// While set, ordinary events are deflected instead of handled
    pub suppress_events: bool,
    pub postponed: bool,

    /// Shutdown or the install handoff began: suppression is never lifted again
    pub shutting_down: bool,

    pub dialog_visible: bool,
    pub activity_visible: bool,

    pub update_info: UpdateInfo,
    pub update_available: bool,
    pub loop_test_mode: bool,
    pub mandatory: bool,

    pub last_media_path: Option<PathBuf>,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Sets `suppress_events` for the lifetime of the guard.
///
/// The flag is cleared on drop, so every exit path of a suppression window
/// (including unwinding) resets it.
pub struct SuppressionWindow<'a> {
    flag: &'a mut bool,
}

impl<'a> SuppressionWindow<'a> {
    pub fn open(state: &'a mut SupervisorState) -> Self {
        state.suppress_events = true;
        Self {
            flag: &mut state.suppress_events,
        }
    }
}

impl Drop for SuppressionWindow<'_> {
    fn drop(&mut self) {
        *self.flag = false;
    }
}
