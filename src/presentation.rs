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

use crate::state::UpdateInfo;
use crate::status::ErrorReport;

pub const UPDATE_AVAILABLE: &str = "Update available";
pub const MANDATORY_NOTICE: &str = "This update is mandatory and will be installed now.";
pub const UPDATE_QUESTION: &str = "Do you want to download and install it now?";

/// Flavor of the "update available" prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Only an accept button
    Mandatory,
    /// Accept and defer buttons
    Optional,
}

impl PromptKind {
    pub fn as_str(&self) -> &str {
        match self {
            PromptKind::Mandatory => "Mandatory",
            PromptKind::Optional => "Optional",
        }
    }
}

/// Commands the supervisor issues to whatever UI is listening.
///
/// Calls come from the dispatcher and from the download worker, never
/// concurrently for the same download, and must not block for long.
pub trait PresentationPort: Send + Sync {
    fn show_persistent_notification(&self, text: &str);

    fn hide_persistent_notification(&self);

    fn show_blocking_prompt(&self, kind: PromptKind, text: &str);

    fn report_progress(&self, percent: i32);

    fn report_terminal_error(&self, report: &ErrorReport);

    fn report_download_complete(&self);

    /// The staged artifact vanished between download and install
    fn report_artifact_missing(&self);

    fn bring_to_front(&self, from_service: bool);
}

/// Text of the persistent notification: `"<version> <headline>"`
pub fn notification_text(info: &UpdateInfo) -> String {
    format!("{} {}", info.version, info.headline)
}

/// `"<kind> Update available: <version> <headline>"`
pub fn update_line(info: &UpdateInfo) -> String {
    format!(
        "{} {}: {} {}",
        info.kind, UPDATE_AVAILABLE, info.version, info.headline
    )
}

pub fn prompt_text(kind: PromptKind, info: &UpdateInfo) -> String {
    let notice = match kind {
        PromptKind::Mandatory => MANDATORY_NOTICE,
        PromptKind::Optional => UPDATE_QUESTION,
    };
    format!("{}\n\n{}\n\n{}", update_line(info), notice, info.description)
}
