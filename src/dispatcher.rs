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

//! The serial event loop owning the supervisor state.
//!
//! Events are handled one at a time, in submission order, on a dedicated
//! thread. Engine calls block that thread; anything long (downloads,
//! user-driven checks, the postpone delay) runs elsewhere and reports back
//! through the same queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::cache::{self, SpaceProbe};
use crate::check::UpdateCheck;
use crate::config::Config;
use crate::engine::{Installer, NetworkMonitor, PowerManager, UpdateEngine};
use crate::event::{self, DownloadOutcome, Event, EventReceiver, EventSender, PromptAnswer, UpdateCheckResult};
use crate::presentation::{notification_text, prompt_text, PresentationPort, PromptKind};
use crate::state::{Connectivity, SupervisorState, SuppressionWindow};
use crate::status::{
    ErrorClass, ErrorReport, StatusCode, STATUS_CONNECTION_FAILURE, STATUS_IN_PROGRESS, STATUS_TASK_FAILED,
};
use crate::timer::PostponeTimer;
use crate::worker::{DownloadWorker, WorkerState};
use crate::ServiceError;

/// Agent info key holding the size in bytes of the pending update
pub const UPDATE_SIZE_KEY: &str = "currentUpdateTotalSize";

/// Everything the dispatcher talks to
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn UpdateEngine>,
    pub presentation: Arc<dyn PresentationPort>,
    pub installer: Arc<dyn Installer>,
    pub network: Option<Arc<dyn NetworkMonitor>>,
    pub power: Option<Arc<dyn PowerManager>>,
    pub space: Arc<dyn SpaceProbe>,
}

pub struct Dispatcher {
    config: Config,
    state: SupervisorState,

    runtime: Handle,
    events: EventSender,

    engine: Arc<dyn UpdateEngine>,
    presentation: Arc<dyn PresentationPort>,
    installer: Arc<dyn Installer>,
    network: Option<Arc<dyn NetworkMonitor>>,
    power: Option<Arc<dyn PowerManager>>,
    space: Arc<dyn SpaceProbe>,

    install_dir: PathBuf,
    timer: PostponeTimer,
    worker: Option<Arc<DownloadWorker>>,
    check: Option<UpdateCheck>,
    check_generation: u64,
    setup_done: bool,
}

/// Running dispatcher: the queue producer plus the loop thread.
pub struct DispatcherHandle {
    events: EventSender,
    thread: JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn submit(&self, event: Event) -> Result<(), ServiceError> {
        self.events.submit(event)
    }

    /// Queue a stop request and wait for every event before it to be handled.
    pub fn shutdown(self) -> Result<(), ServiceError> {
        self.events.submit(Event::Terminate)?;
        self.thread.join().map_err(|_| {
            ServiceError::IOError(std::io::Error::other("dispatcher thread panicked"))
        })
    }
}

impl Dispatcher {
    pub fn new(config: Config, collaborators: Collaborators, runtime: Handle, events: EventSender) -> Self {
        let timer = PostponeTimer::new(runtime.clone(), events.clone(), config.postpone_delay());
        let install_dir = config.install_dir().to_path_buf();

        collaborators.engine.set_install_path(&install_dir);

        Self {
            config,
            state: SupervisorState::new(),
            runtime,
            events,
            engine: collaborators.engine,
            presentation: collaborators.presentation,
            installer: collaborators.installer,
            network: collaborators.network,
            power: collaborators.power,
            space: collaborators.space,
            install_dir,
            timer,
            worker: None,
            check: None,
            check_generation: 0,
            setup_done: false,
        }
    }

    /// Create the queue and start handling events on a dedicated thread.
    pub fn launch(
        config: Config,
        collaborators: Collaborators,
        runtime: Handle,
    ) -> Result<DispatcherHandle, ServiceError> {
        let (events, rx) = event::channel();
        let dispatcher = Self::new(config, collaborators, runtime, events.clone());

        let thread = std::thread::Builder::new()
            .name("otavisor-dispatch".to_string())
            .spawn(move || dispatcher.run(rx))?;

        Ok(DispatcherHandle { events, thread })
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Current staging directory for the update artifact
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn run(mut self, mut rx: EventReceiver) {
        info!("Dispatcher started");
        while let Some(event) = rx.blocking_recv() {
            if matches!(event, Event::Terminate) {
                break;
            }
            self.handle(event);
        }

        self.timer.cancel();
        if let Some(check) = self.check.take() {
            check.cancel();
        }
        info!("Dispatcher stopped");
    }

    /// Handle a single event.
    pub fn handle(&mut self, event: Event) {
        info!("#### action = {} ####", event.as_str());

        let event = match event {
            Event::AgentInfoRequest { keys, reply } => return self.answer_agent_info(&keys, reply),
            Event::StartInstall => return self.start_install(),
            Event::Snapshot(reply) => {
                if reply.send(self.state.clone()).is_err() {
                    debug!("Snapshot requester went away");
                }
                return;
            }
            Event::Terminate => return,
            event => event,
        };

        let event = match self.handle_session(event) {
            Some(event) => event,
            None => return,
        };

        if self.state.suppress_events {
            return self.deflect(event);
        }

        let needs_notification = match event {
            Event::BootCompleted => {
                self.remove_stale_artifact();
                false
            }
            Event::ShutdownRequested => {
                self.state.suppress_events = true;
                self.state.shutting_down = true;
                self.engine.on_pre_shutdown();
                false
            }
            Event::UserPresent => self.user_present(),
            Event::ConnectivityChanged { connected } => self.connectivity_changed(connected),
            Event::MediaMounted(uri) => self.media_mounted(&uri),
            Event::UpdatePostponed => {
                self.postpone();
                false
            }
            Event::BringToFront => {
                if self.state.activity_visible {
                    debug!("Update screen already shown");
                } else {
                    self.bring_to_front();
                }
                false
            }
            Event::CheckConnectivity => {
                self.check_connectivity();
                false
            }
            Event::ManageRegStore(values) => {
                self.manage_reg_store(&values);
                false
            }
            other => {
                warn!("Unexpected event {} in normal dispatch", other.as_str());
                false
            }
        };

        if needs_notification {
            self.manage_notification();
        }
    }

    /// Events belonging to the foreground session. They are never deflected:
    /// they answer whatever holds suppression. Once shutdown or the install
    /// handoff began they are dropped, nothing may lift suppression anymore.
    /// Returns the event back when it isn't one of them.
    fn handle_session(&mut self, event: Event) -> Option<Event> {
        if !event.is_session() {
            return Some(event);
        }

        if self.state.shutting_down {
            info!("Shutting down, ignoring {}", event.as_str());
            return None;
        }

        match event {
            Event::ScreenVisibility(visible) => self.screen_visibility(visible),
            Event::PromptAnswered(PromptAnswer::Accept) => self.accept_update(),
            Event::PromptAnswered(PromptAnswer::Defer) => self.defer_update(),
            Event::CheckForUpdate => self.check_for_update(),
            Event::CancelCheck => self.cancel_check(),
            Event::CancelDownload => self.cancel_download(),
            Event::UpdateCheckFinished { generation, result } => self.check_finished(generation, result),
            Event::DownloadFinished(outcome) => self.download_finished(outcome),
            Event::ConfirmInstall => self.confirm_install(),
            Event::Dismiss => self.dismiss(),
            Event::PostponeExpired { generation } => self.postpone_expired(generation),
            other => warn!("Unexpected event {} in session dispatch", other.as_str()),
        }
        None
    }

    fn answer_agent_info(&self, keys: &[String], reply: Option<oneshot::Sender<Vec<String>>>) {
        let Some(reply) = reply else {
            error!("Agent info request without a reply channel, dropping it");
            return;
        };

        let values = self.engine.agent_info(keys);
        if reply.send(values).is_err() {
            warn!("Agent info requester went away before the reply");
        }
    }

    fn deflect(&mut self, event: Event) {
        info!("Events suppressed, deflecting {}", event.as_str());

        if !self.state.dialog_visible && !self.state.activity_visible {
            self.bring_to_front();
        }

        if self.state.dialog_visible && !self.state.shutting_down {
            self.manage_notification();
        }
    }

    fn bring_to_front(&self) {
        self.presentation.bring_to_front(true);
    }

    fn staged_artifact(&self) -> PathBuf {
        self.install_dir.join(self.config.artifact_name())
    }

    fn remove_stale_artifact(&self) {
        let artifact = self.staged_artifact();
        if !artifact.exists() {
            return;
        }

        match std::fs::remove_file(&artifact) {
            Ok(()) => info!("Removed stale update {}", artifact.display()),
            Err(e) => warn!("Couldn't remove stale update {}: {e}", artifact.display()),
        }
    }

    fn check_connectivity(&mut self) {
        if self.state.connectivity == Connectivity::Connected {
            return;
        }

        let Some(network) = self.network.as_ref() else {
            warn!("No network monitor, connectivity unknown");
            self.state.connectivity = Connectivity::Unknown;
            return;
        };

        if network.is_connected() {
            self.state.connectivity = Connectivity::Connected;
            self.engine.on_network_up();
        } else {
            self.state.connectivity = Connectivity::NotConnected;
        }
        debug!("Connectivity is now {}", self.state.connectivity.as_str());
    }

    fn user_present(&mut self) -> bool {
        self.check_connectivity();
        if self.state.connectivity != Connectivity::Connected {
            return false;
        }

        let engine = &self.engine;
        let _window = SuppressionWindow::open(&mut self.state);
        engine.check_ota_available() > 0
    }

    fn connectivity_changed(&mut self, connected: bool) -> bool {
        if !connected {
            self.state.connectivity = Connectivity::NotConnected;
            return false;
        }

        if self.state.connectivity == Connectivity::Connected {
            debug!("Already connected, ignoring");
            return false;
        }

        self.state.connectivity = Connectivity::Connected;
        let engine = &self.engine;
        let _window = SuppressionWindow::open(&mut self.state);
        engine.on_network_up();
        engine.check_ota_available() > 0
    }

    fn media_mounted(&mut self, uri: &str) -> bool {
        if uri == self.config.default_media_root() {
            info!("Ignoring the default media root {uri}");
            return false;
        }

        let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        info!("Media mounted at {}", path.display());

        let available = self.engine.check_media_available(&path) > 0;
        self.state.last_media_path = Some(path);
        available
    }

    fn manage_reg_store(&self, values: &[String]) {
        let status = self.engine.manage_reg_store(values);
        if status == STATUS_IN_PROGRESS {
            info!("Registration store updated with {} values", values.len());
        } else {
            warn!("Registration store update failed with status {status}");
        }
    }

    /// Whether the first-boot setup is over. Once seen done it stays done.
    fn device_provisioned(&mut self) -> bool {
        if self.setup_done {
            return true;
        }

        self.setup_done = match self.config.setup_done_marker() {
            Some(marker) => marker.exists(),
            None => true,
        };
        self.setup_done
    }

    fn postpone(&mut self) {
        self.presentation.hide_persistent_notification();

        if self.state.mandatory {
            warn!("The pending update is mandatory and can't be postponed");
            return;
        }

        self.state.postponed = true;
        let generation = self.timer.arm();
        info!("Update postponed (timer #{generation})");
    }

    fn postpone_expired(&mut self, generation: u64) {
        if !self.timer.is_current(generation) {
            debug!("Ignoring stale postpone timer #{generation}");
            return;
        }

        self.timer.fired();
        self.state.postponed = false;
        info!("Postponement over");
    }

    fn prompt_kind(&self) -> PromptKind {
        if self.state.mandatory {
            PromptKind::Mandatory
        } else {
            PromptKind::Optional
        }
    }

    fn show_prompt(&mut self) {
        self.state.dialog_visible = true;
        let kind = self.prompt_kind();
        let text = prompt_text(kind, &self.state.update_info);
        self.presentation.show_blocking_prompt(kind, &text);
    }

    fn manage_notification(&mut self) {
        self.state.mandatory = !self.engine.is_current_update_optional();
        if self.state.mandatory && self.state.postponed {
            info!("Mandatory update, dropping the postponement");
            self.state.postponed = false;
            self.timer.cancel();
        }

        if self.state.postponed {
            info!("Update postponed, not prompting");
            return;
        }

        if !self.device_provisioned() {
            info!("Device setup not finished, not prompting");
            return;
        }

        self.state.suppress_events = true;
        self.state.loop_test_mode = self.engine.is_loop_test_mode();
        self.state.update_available = true;
        self.state.update_info = self.engine.update_info();

        self.presentation
            .show_persistent_notification(&notification_text(&self.state.update_info));
        self.show_prompt();

        if self.state.loop_test_mode {
            info!("Loop test mode, accepting the update");
            self.accept_update();
        }
    }

    fn accept_update(&mut self) {
        self.state.dialog_visible = false;

        if !self.state.update_available {
            self.check_for_update();
            return;
        }

        if let Some(worker) = self.worker.as_ref() {
            if worker.is_running() {
                warn!("A download is already running");
                return;
            }
        }

        self.state.suppress_events = true;

        let reported = self
            .engine
            .agent_info(&[UPDATE_SIZE_KEY.to_string()])
            .into_iter()
            .next()
            .unwrap_or_default();
        let target = cache::prepare_install_target(&self.config, self.space.as_ref(), &reported, &self.install_dir);
        if target != self.install_dir {
            info!("Staging the update in {}", target.display());
            self.engine.set_install_path(&target);
            self.install_dir = target;
        }

        let worker = Arc::new(DownloadWorker::new(
            self.engine.clone(),
            self.events.clone(),
            self.power.clone(),
            self.config.poll_interval(),
        ));
        if self.state.activity_visible {
            worker.set_presentation_handle(Some(self.presentation.clone()));
        }

        match worker.start(&self.runtime) {
            Ok(_) => self.worker = Some(worker),
            Err(e) => {
                error!("Couldn't start the download: {e}");
                self.state.suppress_events = false;
                return;
            }
        }

        if !self.state.activity_visible {
            self.bring_to_front();
        }
    }

    fn defer_update(&mut self) {
        if self.state.mandatory {
            warn!("Mandatory update can't be deferred");
            return;
        }

        self.state.dialog_visible = false;
        self.state.suppress_events = false;
        self.postpone();
    }

    fn screen_visibility(&mut self, visible: bool) {
        self.state.activity_visible = visible;

        let Some(worker) = self.worker.clone() else {
            return;
        };

        if !visible {
            worker.set_presentation_handle(None);
            return;
        }

        match worker.state() {
            WorkerState::Running => worker.set_presentation_handle(Some(self.presentation.clone())),
            WorkerState::Complete => self.presentation.report_download_complete(),
            WorkerState::Failed(code) => {
                self.report_status(code);
                self.worker = None;
            }
            WorkerState::Idle => {}
        }
    }

    fn report_status(&self, code: StatusCode) {
        let report = ErrorReport::new(code, |c| self.engine.message_for_code(c));
        if report.class == ErrorClass::Aborted {
            debug!("Operation aborted, nothing to report");
            return;
        }
        self.presentation.report_terminal_error(&report);
    }

    fn check_for_update(&mut self) {
        if self.check.is_some() {
            info!("An update check is already running");
            return;
        }
        if self.worker.as_ref().is_some_and(|w| w.is_running()) {
            info!("A download is running, not checking");
            return;
        }

        self.check_connectivity();
        if self.state.connectivity != Connectivity::Connected {
            self.report_status(STATUS_CONNECTION_FAILURE);
            return;
        }

        self.state.suppress_events = true;
        self.check_generation += 1;
        self.check = Some(UpdateCheck::spawn(
            &self.runtime,
            self.engine.clone(),
            self.events.clone(),
            self.check_generation,
        ));
    }

    fn cancel_check(&mut self) {
        match self.check.take() {
            Some(check) => {
                info!("Cancelling update check #{}", check.generation());
                check.cancel();
                self.state.suppress_events = false;
            }
            None => debug!("No update check to cancel"),
        }
    }

    fn cancel_download(&mut self) {
        if self.worker.as_ref().is_some_and(|w| w.is_running()) {
            info!("Aborting the running download");
            self.engine.abort();
        } else {
            debug!("No download to cancel");
        }
    }

    fn check_finished(&mut self, generation: u64, result: UpdateCheckResult) {
        if self.check.as_ref().map(UpdateCheck::generation) != Some(generation) {
            debug!("Ignoring result of stale update check #{generation}");
            return;
        }
        self.check = None;

        self.state.suppress_events = false;

        if !result.available {
            self.state.update_available = false;
            self.report_status(result.status);
            return;
        }

        self.state.update_available = true;
        self.state.mandatory = result.mandatory;
        self.state.loop_test_mode = result.loop_test;
        if result.mandatory {
            self.state.postponed = false;
            self.timer.cancel();
        }
        self.state.update_info = self.engine.update_info();
        self.state.suppress_events = true;

        if result.loop_test {
            self.accept_update();
        } else {
            self.show_prompt();
        }
    }

    fn download_finished(&mut self, outcome: DownloadOutcome) {
        self.state.suppress_events = false;

        match outcome {
            DownloadOutcome::Complete => {
                if self.state.loop_test_mode {
                    info!("Loop test mode, installing right away");
                    self.start_install();
                }
            }
            // the worker couldn't tell the screen itself
            DownloadOutcome::Failed(STATUS_TASK_FAILED) if self.state.activity_visible => {
                self.report_status(STATUS_TASK_FAILED);
                self.worker = None;
            }
            DownloadOutcome::Failed(code) => {
                if ErrorClass::classify(code) == ErrorClass::Aborted {
                    self.worker = None;
                }
            }
        }
    }

    fn confirm_install(&mut self) {
        self.state.suppress_events = false;

        if self.staged_artifact().exists() {
            self.start_install();
            return;
        }

        warn!("Staged update {} is gone", self.staged_artifact().display());
        self.engine.set_ready_to_install(false);
        self.worker = None;
        self.presentation.report_artifact_missing();
    }

    fn dismiss(&mut self) {
        if self.worker.as_ref().is_some_and(|w| w.is_running()) {
            warn!("Can't dismiss while downloading");
            return;
        }

        self.worker = None;
        self.state.suppress_events = false;
    }

    fn start_install(&mut self) {
        self.presentation.hide_persistent_notification();

        let artifact = self.staged_artifact();
        if !artifact.exists() {
            info!("No staged update at {}, nothing to install", artifact.display());
            return;
        }

        self.state.suppress_events = true;
        self.engine.on_pre_shutdown();
        info!("Handing {} to the installer", artifact.display());

        match self.installer.install_package(&artifact) {
            Ok(()) => self.state.shutting_down = true,
            Err(e) => {
                error!("Install failed: {e}");
                self.state.suppress_events = false;
            }
        }
    }
}
