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

use log::{debug, error};
use tokio::sync::mpsc;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface};

use crate::engine::EngineVersions;
use crate::event::{Event, EventSender, PromptAnswer};
use crate::presentation::{PresentationPort, PromptKind};
use crate::status::ErrorReport;
use crate::ServiceError;

pub const SERVICE_NAME: &str = "org.otavisor.Supervisor";
pub const OBJECT_PATH: &str = "/org/otavisor/Supervisor";

/// Agent keys gathered for the device info report
pub const DEVICE_INFO_KEYS: &[&str] = &[
    "ESN", "UID", "TSR", "QH", "VER", "INF", "OUI", "MG", "HM", "SV", "MV", "NP", "REG", "LP",
    "EC", "LE", "LES", "LET",
];

fn failed(e: ServiceError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

/// Render the device info report shown by `GetDeviceInfo`
pub fn format_device_info(versions: &EngineVersions, keys: &[&str], values: &[String]) -> String {
    let mut report = format!(
        "Service : {}\nLibrary : {}\nPrivate Library : {}\nBuild Variant : {}\n",
        env!("CARGO_PKG_VERSION"),
        versions.library,
        versions.private_library,
        versions.build_variant,
    );
    for (key, value) in keys.iter().zip(values) {
        report.push_str(&format!("{key} : {value}\n"));
    }
    report
}

pub struct SupervisorDBus {
    events: EventSender,
    versions: EngineVersions,
}

impl SupervisorDBus {
    pub fn new(events: EventSender, versions: EngineVersions) -> Self {
        Self { events, versions }
    }

    fn submit(&self, event: Event) -> fdo::Result<()> {
        self.events.submit(event).map_err(failed)
    }
}

#[interface(
    name = "org.otavisor.Supervisor1",
    proxy(
        default_service = "org.otavisor.Supervisor",
        default_path = "/org/otavisor/Supervisor"
    )
)]
impl SupervisorDBus {
    async fn boot_completed(&self) -> fdo::Result<()> {
        self.submit(Event::BootCompleted)
    }

    async fn shutdown(&self) -> fdo::Result<()> {
        self.submit(Event::ShutdownRequested)
    }

    async fn user_present(&self) -> fdo::Result<()> {
        self.submit(Event::UserPresent)
    }

    /// Link state change, as reported by the platform broadcast
    async fn connectivity_changed(&self, no_connectivity: bool) -> fdo::Result<()> {
        self.submit(Event::ConnectivityChanged {
            connected: !no_connectivity,
        })
    }

    /// Parameters:
    /// - uri: mount point, e.g. `file:///mnt/usb`
    async fn media_mounted(&self, uri: String) -> fdo::Result<()> {
        self.submit(Event::MediaMounted(uri))
    }

    async fn start_install(&self) -> fdo::Result<()> {
        self.submit(Event::StartInstall)
    }

    async fn postpone(&self) -> fdo::Result<()> {
        self.submit(Event::UpdatePostponed)
    }

    async fn bring_to_front(&self) -> fdo::Result<()> {
        self.submit(Event::BringToFront)
    }

    async fn check_connectivity(&self) -> fdo::Result<()> {
        self.submit(Event::CheckConnectivity)
    }

    /// Pass registration store values through to the engine
    async fn manage_reg_store(&self, values: Vec<String>) -> fdo::Result<()> {
        self.submit(Event::ManageRegStore(values))
    }

    /// Values for the given agent keys, in request order
    async fn get_agent_info(&self, keys: Vec<String>) -> fdo::Result<Vec<String>> {
        self.events.agent_info(keys).await.map_err(failed)
    }

    /// Get the supervisor state
    /// Returns: (connectivity, suppressed, postponed, mandatory, pending version)
    async fn get_state(&self) -> fdo::Result<(String, bool, bool, bool, String)> {
        let state = self.events.snapshot().await.map_err(failed)?;
        Ok((
            state.connectivity.as_str().to_string(),
            state.suppress_events,
            state.postponed,
            state.mandatory,
            state.update_info.version,
        ))
    }

    async fn get_device_info(&self) -> fdo::Result<String> {
        let keys = DEVICE_INFO_KEYS.iter().map(|k| k.to_string()).collect();
        let values = self.events.agent_info(keys).await.map_err(failed)?;
        Ok(format_device_info(&self.versions, DEVICE_INFO_KEYS, &values))
    }

    /// The update screen attached (true) or went away (false)
    async fn screen_visibility(&self, visible: bool) -> fdo::Result<()> {
        self.submit(Event::ScreenVisibility(visible))
    }

    /// Answer the update prompt: true downloads now, false postpones
    async fn answer_prompt(&self, accept: bool) -> fdo::Result<()> {
        let answer = if accept {
            PromptAnswer::Accept
        } else {
            PromptAnswer::Defer
        };
        self.submit(Event::PromptAnswered(answer))
    }

    async fn check_for_update(&self) -> fdo::Result<()> {
        self.submit(Event::CheckForUpdate)
    }

    async fn cancel_check(&self) -> fdo::Result<()> {
        self.submit(Event::CancelCheck)
    }

    async fn cancel_download(&self) -> fdo::Result<()> {
        self.submit(Event::CancelDownload)
    }

    async fn confirm_install(&self) -> fdo::Result<()> {
        self.submit(Event::ConfirmInstall)
    }

    async fn dismiss(&self) -> fdo::Result<()> {
        self.submit(Event::Dismiss)
    }

    #[zbus(signal)]
    async fn notification_shown(signal_emitter: &SignalEmitter<'_>, text: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn notification_hidden(signal_emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    /// Arguments: kind ("Mandatory" or "Optional"), prompt text
    #[zbus(signal)]
    async fn prompt_shown(signal_emitter: &SignalEmitter<'_>, kind: &str, text: &str) -> zbus::Result<()>;

    /// Download progress, 0-100
    #[zbus(signal)]
    async fn progress(signal_emitter: &SignalEmitter<'_>, percent: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn terminal_error(
        signal_emitter: &SignalEmitter<'_>,
        code: i32,
        class: &str,
        message: &str,
        details: &str,
        retry: bool,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn download_complete(signal_emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn artifact_missing(signal_emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    /// The update screen should be shown
    #[zbus(signal)]
    async fn front_requested(signal_emitter: &SignalEmitter<'_>, from_service: bool) -> zbus::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresentationCommand {
    ShowNotification(String),
    HideNotification,
    ShowPrompt(PromptKind, String),
    Progress(i32),
    TerminalError(ErrorReport),
    DownloadComplete,
    ArtifactMissing,
    BringToFront(bool),
}

/// Presentation port turning commands into D-Bus signals.
///
/// Commands are queued from whatever thread issues them and emitted in
/// order by a single task, see [`forward_presentation`].
#[derive(Clone)]
pub struct DBusPresentation {
    tx: mpsc::UnboundedSender<PresentationCommand>,
}

pub type PresentationReceiver = mpsc::UnboundedReceiver<PresentationCommand>;

impl DBusPresentation {
    pub fn channel() -> (Self, PresentationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: PresentationCommand) {
        if self.tx.send(command).is_err() {
            error!("Presentation channel closed, command dropped");
        }
    }
}

impl PresentationPort for DBusPresentation {
    fn show_persistent_notification(&self, text: &str) {
        self.send(PresentationCommand::ShowNotification(text.to_string()))
    }

    fn hide_persistent_notification(&self) {
        self.send(PresentationCommand::HideNotification)
    }

    fn show_blocking_prompt(&self, kind: PromptKind, text: &str) {
        self.send(PresentationCommand::ShowPrompt(kind, text.to_string()))
    }

    fn report_progress(&self, percent: i32) {
        self.send(PresentationCommand::Progress(percent))
    }

    fn report_terminal_error(&self, report: &ErrorReport) {
        self.send(PresentationCommand::TerminalError(report.clone()))
    }

    fn report_download_complete(&self) {
        self.send(PresentationCommand::DownloadComplete)
    }

    fn report_artifact_missing(&self) {
        self.send(PresentationCommand::ArtifactMissing)
    }

    fn bring_to_front(&self, from_service: bool) {
        self.send(PresentationCommand::BringToFront(from_service))
    }
}

/// Emit queued presentation commands as signals until the sender side is gone
pub async fn forward_presentation(mut rx: PresentationReceiver, emitter: SignalEmitter<'static>) {
    while let Some(command) = rx.recv().await {
        debug!("Emitting {command:?}");

        let emitted = match &command {
            PresentationCommand::ShowNotification(text) => {
                SupervisorDBus::notification_shown(&emitter, text).await
            }
            PresentationCommand::HideNotification => SupervisorDBus::notification_hidden(&emitter).await,
            PresentationCommand::ShowPrompt(kind, text) => {
                SupervisorDBus::prompt_shown(&emitter, kind.as_str(), text).await
            }
            PresentationCommand::Progress(percent) => SupervisorDBus::progress(&emitter, *percent).await,
            PresentationCommand::TerminalError(report) => {
                SupervisorDBus::terminal_error(
                    &emitter,
                    report.code,
                    report.class.as_str(),
                    &report.message,
                    &report.details,
                    report.offers_retry(),
                )
                .await
            }
            PresentationCommand::DownloadComplete => SupervisorDBus::download_complete(&emitter).await,
            PresentationCommand::ArtifactMissing => SupervisorDBus::artifact_missing(&emitter).await,
            PresentationCommand::BringToFront(from_service) => {
                SupervisorDBus::front_requested(&emitter, *from_service).await
            }
        };

        if let Err(e) = emitted {
            error!("Failed to emit DBus signal: {}", e);
        }
    }
}
