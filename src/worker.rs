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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::engine::{PowerManager, UpdateEngine, WakeLockGuard};
use crate::event::{DownloadOutcome, Event, EventSender};
use crate::presentation::PresentationPort;
use crate::status::{
    ErrorClass, ErrorReport, STATUS_DOWNLOAD_COMPLETE, STATUS_IN_PROGRESS, STATUS_TASK_FAILED,
};
use crate::ServiceError;

/// Lifecycle of a single download worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Complete,
    Failed(i32),
}

struct Session {
    state: WorkerState,
    percent: i32,
}

/// Ends a run on every exit path, including a panic inside the engine.
struct RunFinish<'a> {
    worker: &'a DownloadWorker,
    outcome: Option<DownloadOutcome>,
}

impl Drop for RunFinish<'_> {
    fn drop(&mut self) {
        match self.outcome {
            Some(outcome) => self.worker.finish(outcome, false),
            None => {
                error!("Download loop died without an outcome");
                self.worker.finish(DownloadOutcome::Failed(STATUS_TASK_FAILED), true);
            }
        }
    }
}

/// Drives one download to completion on the blocking pool.
///
/// Workers are single use: once started they can't be started again, a
/// new download needs a new worker.
pub struct DownloadWorker {
    engine: Arc<dyn UpdateEngine>,
    events: EventSender,
    power: Option<Arc<dyn PowerManager>>,
    poll_interval: Duration,

    session: Mutex<Session>,
    handle: Mutex<Option<Arc<dyn PresentationPort>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DownloadWorker {
    pub fn new(
        engine: Arc<dyn UpdateEngine>,
        events: EventSender,
        power: Option<Arc<dyn PowerManager>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            events,
            power,
            poll_interval,
            session: Mutex::new(Session {
                state: WorkerState::Idle,
                percent: 0,
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        lock(&self.session).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Last progress published, 0 to 100
    pub fn progress(&self) -> i32 {
        lock(&self.session).percent
    }

    /// Attach (or detach with `None`) the screen receiving progress and results.
    pub fn set_presentation_handle(&self, handle: Option<Arc<dyn PresentationPort>>) {
        debug!(
            "Download worker presentation handle {}",
            if handle.is_some() { "attached" } else { "detached" }
        );
        *lock(&self.handle) = handle;
    }

    pub fn has_presentation_handle(&self) -> bool {
        lock(&self.handle).is_some()
    }

    /// Start the download loop on `runtime`'s blocking pool.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> Result<JoinHandle<DownloadOutcome>, ServiceError> {
        {
            let mut session = lock(&self.session);
            if session.state != WorkerState::Idle {
                return Err(ServiceError::WorkerAlreadyStarted);
            }
            session.state = WorkerState::Running;
            session.percent = 0;
        }

        let worker = self.clone();
        Ok(runtime.spawn_blocking(move || worker.run()))
    }

    fn run(&self) -> DownloadOutcome {
        let wake_lock = match self.power.as_deref() {
            Some(power) => Some(WakeLockGuard::acquire(power)),
            None => {
                warn!("No power manager available: the system may sleep during the download");
                None
            }
        };
        let mut finish = RunFinish {
            worker: self,
            outcome: None,
        };

        info!("Starting scheduled download");
        let outcome = self.download();
        finish.outcome = Some(outcome);

        drop(finish);
        drop(wake_lock);
        outcome
    }

    /// Record the end of a run and tell the dispatcher about it
    fn finish(&self, outcome: DownloadOutcome, unwinding: bool) {
        lock(&self.session).state = match outcome {
            DownloadOutcome::Complete => WorkerState::Complete,
            DownloadOutcome::Failed(code) => WorkerState::Failed(code),
        };

        // the engine just blew up, don't call back into it while unwinding:
        // the failure is replayed from the dispatcher when a screen attaches
        if !unwinding {
            self.deliver_outcome(outcome);
        }

        if let Err(e) = self.events.submit(Event::DownloadFinished(outcome)) {
            warn!("Couldn't report the end of the download: {e}");
        }

        // Nobody saw the result: ask for the screen so it isn't lost
        if unwinding || !self.has_presentation_handle() {
            info!("Download ended unseen, requesting the update screen");
            if let Err(e) = self.events.submit(Event::BringToFront) {
                warn!("Couldn't request the update screen: {e}");
            }
        }
    }

    fn download(&self) -> DownloadOutcome {
        self.engine.start_scheduled_download();

        loop {
            std::thread::sleep(self.poll_interval);

            let code = self.engine.download_status_code();
            let percent = self.engine.download_percent();
            self.publish_progress(percent);

            if self.engine.is_ready_to_install() {
                self.publish_progress(100);
                info!("Download complete, update ready to install");
                return DownloadOutcome::Complete;
            }

            match code {
                STATUS_IN_PROGRESS => continue,
                STATUS_DOWNLOAD_COMPLETE => {
                    info!("Engine reports download complete");
                    return DownloadOutcome::Complete;
                }
                code => {
                    warn!("Download ended with status {code}");
                    return DownloadOutcome::Failed(code);
                }
            }
        }
    }

    fn publish_progress(&self, percent: i32) {
        let percent = percent.clamp(0, 100);
        {
            let mut session = lock(&self.session);
            if percent == session.percent && percent != 0 {
                return;
            }
            if percent < session.percent {
                debug!(
                    "Ignoring progress going backwards ({} -> {percent})",
                    session.percent
                );
                return;
            }
            session.percent = percent;
        }

        if let Some(handle) = lock(&self.handle).as_ref() {
            handle.report_progress(percent);
        }
    }

    fn deliver_outcome(&self, outcome: DownloadOutcome) {
        let handle = lock(&self.handle);
        let Some(handle) = handle.as_ref() else {
            debug!("No screen attached, outcome {outcome:?} kept for later");
            return;
        };

        match outcome {
            DownloadOutcome::Complete => handle.report_download_complete(),
            DownloadOutcome::Failed(code) => {
                let report = ErrorReport::new(code, |c| self.engine.message_for_code(c));
                if report.class == ErrorClass::Aborted {
                    debug!("Download aborted, nothing to report");
                    return;
                }
                handle.report_terminal_error(&report);
            }
        }
    }
}
