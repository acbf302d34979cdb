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

use tokio::sync::{mpsc, oneshot};

use crate::state::SupervisorState;
use crate::status::StatusCode;
use crate::ServiceError;

/// Answer given to the "update available" prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptAnswer {
    Accept,
    Defer,
}

/// How a download worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Complete,
    Failed(StatusCode),
}

/// Everything a user-driven update check learned, applied as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCheckResult {
    pub available: bool,
    pub mandatory: bool,
    pub loop_test: bool,
    /// Engine status after the check, used to explain a negative result
    pub status: StatusCode,
}

/// Events consumed by the dispatcher
#[derive(Debug)]
pub enum Event {
    BootCompleted,
    ShutdownRequested,
    UserPresent,
    ConnectivityChanged {
        connected: bool,
    },
    /// Raw media URI, e.g. `file:///mnt/usb`
    MediaMounted(String),
    StartInstall,
    UpdatePostponed,
    BringToFront,
    CheckConnectivity,
    AgentInfoRequest {
        keys: Vec<String>,
        reply: Option<oneshot::Sender<Vec<String>>>,
    },
    /// Values handed as-is to the engine's registration store
    ManageRegStore(Vec<String>),

    /// The foreground screen attached (`true`) or went away (`false`)
    ScreenVisibility(bool),
    PromptAnswered(PromptAnswer),
    CheckForUpdate,
    CancelCheck,
    CancelDownload,
    UpdateCheckFinished {
        generation: u64,
        result: UpdateCheckResult,
    },
    DownloadFinished(DownloadOutcome),
    /// The "download complete, restart now" prompt was confirmed
    ConfirmInstall,
    /// An error or informational message was dismissed
    Dismiss,
    PostponeExpired {
        generation: u64,
    },
    Snapshot(oneshot::Sender<SupervisorState>),
    /// Stop the dispatcher loop
    Terminate,
}

impl Event {
    /// Name used in logs
    pub fn as_str(&self) -> &str {
        match self {
            Event::BootCompleted => "BootCompleted",
            Event::ShutdownRequested => "ShutdownRequested",
            Event::UserPresent => "UserPresent",
            Event::ConnectivityChanged { .. } => "ConnectivityChanged",
            Event::MediaMounted(_) => "MediaMounted",
            Event::StartInstall => "StartInstall",
            Event::UpdatePostponed => "UpdatePostponed",
            Event::BringToFront => "BringToFront",
            Event::CheckConnectivity => "CheckConnectivity",
            Event::AgentInfoRequest { .. } => "AgentInfoRequest",
            Event::ManageRegStore(_) => "ManageRegStore",
            Event::ScreenVisibility(_) => "ScreenVisibility",
            Event::PromptAnswered(_) => "PromptAnswered",
            Event::CheckForUpdate => "CheckForUpdate",
            Event::CancelCheck => "CancelCheck",
            Event::CancelDownload => "CancelDownload",
            Event::UpdateCheckFinished { .. } => "UpdateCheckFinished",
            Event::DownloadFinished(_) => "DownloadFinished",
            Event::ConfirmInstall => "ConfirmInstall",
            Event::Dismiss => "Dismiss",
            Event::PostponeExpired { .. } => "PostponeExpired",
            Event::Snapshot(_) => "Snapshot",
            Event::Terminate => "Terminate",
        }
    }

    /// Events coming from the foreground session (or its background tasks)
    /// rather than from the platform
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            Event::ScreenVisibility(_)
                | Event::PromptAnswered(_)
                | Event::CheckForUpdate
                | Event::CancelCheck
                | Event::CancelDownload
                | Event::UpdateCheckFinished { .. }
                | Event::DownloadFinished(_)
                | Event::ConfirmInstall
                | Event::Dismiss
                | Event::PostponeExpired { .. }
        )
    }
}

/// Producer side of the dispatcher queue. Cheap to clone, usable from any thread.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

impl EventSender {
    pub fn submit(&self, event: Event) -> Result<(), ServiceError> {
        self.tx
            .send(event)
            .map_err(|_| ServiceError::DispatcherClosed)
    }

    /// Ask the dispatcher for agent info and wait for its reply.
    pub async fn agent_info(&self, keys: Vec<String>) -> Result<Vec<String>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::AgentInfoRequest {
            keys,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| ServiceError::DispatcherClosed)
    }

    /// Clone of the state as seen after every event queued so far.
    pub async fn snapshot(&self) -> Result<SupervisorState, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Event::Snapshot(reply))?;
        rx.await.map_err(|_| ServiceError::DispatcherClosed)
    }
}
