#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use otavisor::cache::SpaceProbe;
use otavisor::config::Config;
use otavisor::dbus::PresentationCommand;
use otavisor::dispatcher::{Collaborators, Dispatcher, DispatcherHandle};
use otavisor::engine::{Installer, NetworkMonitor, PowerManager, UpdateEngine};
use otavisor::event::{Event, EventSender};
use otavisor::presentation::{PresentationPort, PromptKind};
use otavisor::state::{SupervisorState, UpdateInfo};
use otavisor::status::{ErrorReport, StatusCode};
use otavisor::ServiceError;

/// One download poll: status code, percent, ready-to-install flag
#[derive(Clone, Copy, Debug)]
pub struct Step {
    pub code: StatusCode,
    pub percent: i32,
    pub ready: bool,
}

pub fn step(code: StatusCode, percent: i32) -> Step {
    Step {
        code,
        percent,
        ready: false,
    }
}

pub fn ready(percent: i32) -> Step {
    Step {
        code: 0,
        percent,
        ready: true,
    }
}

#[derive(Default)]
struct Script {
    ota_available: i32,
    media_available: i32,
    mandatory: bool,
    loop_test: bool,
    status: StatusCode,
    check_delay: Duration,
    steps: VecDeque<Step>,
    current: Option<Step>,
    agent: HashMap<String, String>,
    rolling_info: bool,
    info_serial: usize,
}

/// Scripted engine recording every call by name
#[derive(Default)]
pub struct FakeEngine {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    media_paths: Mutex<Vec<PathBuf>>,
    reg_store: Mutex<Vec<String>>,
    panic_on_poll: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ota_available(self, count: i32) -> Self {
        self.script.lock().unwrap().ota_available = count;
        self
    }

    pub fn with_media_available(self, count: i32) -> Self {
        self.script.lock().unwrap().media_available = count;
        self
    }

    pub fn mandatory(self) -> Self {
        self.script.lock().unwrap().mandatory = true;
        self
    }

    pub fn loop_test(self) -> Self {
        self.script.lock().unwrap().loop_test = true;
        self
    }

    pub fn with_status(self, status: StatusCode) -> Self {
        self.script.lock().unwrap().status = status;
        self
    }

    pub fn with_check_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().check_delay = delay;
        self
    }

    pub fn with_download(self, steps: &[Step]) -> Self {
        self.script.lock().unwrap().steps = steps.iter().copied().collect();
        self
    }

    /// Every `update_info` call returns a new, self-consistent update
    pub fn with_rolling_info(self) -> Self {
        self.script.lock().unwrap().rolling_info = true;
        self
    }

    /// Blow up on the first download poll
    pub fn panicking_download(self) -> Self {
        self.panic_on_poll.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_agent_value(self, key: &str, value: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .agent
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Paths passed to `check_media_available`, in call order
    pub fn media_paths(&self) -> Vec<PathBuf> {
        self.media_paths.lock().unwrap().clone()
    }

    pub fn reg_store(&self) -> Vec<String> {
        self.reg_store.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn current(&self) -> Step {
        self.script.lock().unwrap().current.unwrap_or(step(0, 0))
    }
}

pub fn rolling_info(serial: usize) -> UpdateInfo {
    UpdateInfo {
        version: format!("3.{serial}"),
        headline: format!("headline {serial}"),
        description: format!("description {serial}"),
        kind: format!("kind {serial}"),
    }
}

pub fn sample_info() -> UpdateInfo {
    UpdateInfo {
        version: "2.1".into(),
        headline: "Security fixes".into(),
        description: "Fixes a few things.".into(),
        kind: "System".into(),
    }
}

impl UpdateEngine for FakeEngine {
    fn shared_lib_version(&self) -> String {
        self.record("shared_lib_version");
        "4.2".into()
    }

    fn private_lib_version(&self) -> String {
        self.record("private_lib_version");
        "4.2-p".into()
    }

    fn build_variant(&self) -> String {
        self.record("build_variant");
        "user".into()
    }

    fn check_ota_available(&self) -> i32 {
        self.record("check_ota_available");
        let delay = self.script.lock().unwrap().check_delay;
        std::thread::sleep(delay);
        self.script.lock().unwrap().ota_available
    }

    fn check_media_available(&self, path: &Path) -> i32 {
        self.record("check_media_available");
        self.media_paths.lock().unwrap().push(path.to_path_buf());
        self.script.lock().unwrap().media_available
    }

    fn is_current_update_optional(&self) -> bool {
        !self.script.lock().unwrap().mandatory
    }

    fn is_loop_test_mode(&self) -> bool {
        self.script.lock().unwrap().loop_test
    }

    fn update_info(&self) -> UpdateInfo {
        let mut script = self.script.lock().unwrap();
        if !script.rolling_info {
            return sample_info();
        }
        script.info_serial += 1;
        rolling_info(script.info_serial)
    }

    fn start_scheduled_download(&self) {
        self.record("start_scheduled_download");
    }

    fn download_status_code(&self) -> StatusCode {
        if self.panic_on_poll.load(Ordering::SeqCst) {
            panic!("engine crashed while polling");
        }
        let mut script = self.script.lock().unwrap();
        if let Some(next) = script.steps.pop_front() {
            script.current = Some(next);
        }
        // nothing scripted: the download just completes
        script.current.map(|c| c.code).unwrap_or(114)
    }

    fn download_percent(&self) -> i32 {
        self.current().percent
    }

    fn is_ready_to_install(&self) -> bool {
        self.current().ready
    }

    fn set_ready_to_install(&self, ready: bool) {
        self.record(&format!("set_ready_to_install({ready})"));
    }

    fn set_install_path(&self, _path: &Path) {
        self.record("set_install_path");
    }

    fn on_network_up(&self) {
        self.record("on_network_up");
    }

    fn on_pre_shutdown(&self) {
        self.record("on_pre_shutdown");
    }

    fn on_force_server_contact(&self) {
        self.record("on_force_server_contact");
    }

    fn abort(&self) {
        self.record("abort");
        // the running download ends with the aborted status on its next poll
        let mut script = self.script.lock().unwrap();
        let percent = script.current.map(|c| c.percent).unwrap_or(0);
        script.steps = VecDeque::from([step(9, percent)]);
    }

    fn current_status_code(&self) -> StatusCode {
        self.script.lock().unwrap().status
    }

    fn message_for_code(&self, code: StatusCode) -> String {
        format!("engine error {code}")
    }

    fn agent_info(&self, keys: &[String]) -> Vec<String> {
        self.record("agent_info");
        let script = self.script.lock().unwrap();
        keys.iter()
            .map(|k| script.agent.get(k).cloned().unwrap_or_default())
            .collect()
    }

    fn insert_provisioning_key(&self, key: &[u8]) -> StatusCode {
        self.record(&format!("insert_provisioning_key({})", key.len()));
        0
    }

    fn manage_reg_store(&self, values: &[String]) -> StatusCode {
        self.record("manage_reg_store");
        self.reg_store.lock().unwrap().extend_from_slice(values);
        0
    }
}

#[derive(Default)]
pub struct RecordingPresentation {
    shown: Mutex<Vec<PresentationCommand>>,
}

impl RecordingPresentation {
    pub fn shown(&self) -> Vec<PresentationCommand> {
        self.shown.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<(PromptKind, String)> {
        self.shown()
            .into_iter()
            .filter_map(|c| match c {
                PresentationCommand::ShowPrompt(kind, text) => Some((kind, text)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        self.shown()
            .into_iter()
            .filter_map(|c| match c {
                PresentationCommand::TerminalError(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<i32> {
        self.shown()
            .into_iter()
            .filter_map(|c| match c {
                PresentationCommand::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, command: &PresentationCommand) -> usize {
        self.shown().iter().filter(|c| *c == command).count()
    }

    fn push(&self, command: PresentationCommand) {
        self.shown.lock().unwrap().push(command);
    }
}

impl PresentationPort for RecordingPresentation {
    fn show_persistent_notification(&self, text: &str) {
        self.push(PresentationCommand::ShowNotification(text.to_string()))
    }

    fn hide_persistent_notification(&self) {
        self.push(PresentationCommand::HideNotification)
    }

    fn show_blocking_prompt(&self, kind: PromptKind, text: &str) {
        self.push(PresentationCommand::ShowPrompt(kind, text.to_string()))
    }

    fn report_progress(&self, percent: i32) {
        self.push(PresentationCommand::Progress(percent))
    }

    fn report_terminal_error(&self, report: &ErrorReport) {
        self.push(PresentationCommand::TerminalError(report.clone()))
    }

    fn report_download_complete(&self) {
        self.push(PresentationCommand::DownloadComplete)
    }

    fn report_artifact_missing(&self) {
        self.push(PresentationCommand::ArtifactMissing)
    }

    fn bring_to_front(&self, from_service: bool) {
        self.push(PresentationCommand::BringToFront(from_service))
    }
}

#[derive(Default)]
pub struct CountingPower {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl PowerManager for CountingPower {
    fn acquire_wake_lock(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release_wake_lock(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingInstaller {
    pub fail: AtomicBool,
    installed: Mutex<Vec<PathBuf>>,
}

impl RecordingInstaller {
    pub fn installed(&self) -> Vec<PathBuf> {
        self.installed.lock().unwrap().clone()
    }
}

impl Installer for RecordingInstaller {
    fn install_package(&self, artifact: &Path) -> Result<(), ServiceError> {
        self.installed.lock().unwrap().push(artifact.to_path_buf());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::InstallError("installer exploded".into()));
        }
        Ok(())
    }
}

pub struct FakeNetwork(pub AtomicBool);

impl NetworkMonitor for FakeNetwork {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FixedProbe(pub u64);

impl SpaceProbe for FixedProbe {
    fn free_space(&self, _path: &Path) -> u64 {
        self.0
    }
}

pub fn test_config(root: &Path) -> Config {
    Config::default()
        .with_cache_dir(root.join("cache"))
        .with_install_dir(root.join("cache").join("otavisor"))
        .with_fallback_install_dir(root.join("sdcard"))
        .with_poll_interval(Duration::from_millis(5))
}

/// A running dispatcher wired to fakes
pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub presentation: Arc<RecordingPresentation>,
    pub installer: Arc<RecordingInstaller>,
    pub power: Arc<CountingPower>,
    pub config: Config,
    pub tmp: tempfile::TempDir,
    dispatcher: DispatcherHandle,
}

pub struct HarnessBuilder {
    engine: FakeEngine,
    network: Option<bool>,
    postpone: Duration,
    free_space: u64,
    require_setup: bool,
}

impl HarnessBuilder {
    pub fn new(engine: FakeEngine) -> Self {
        Self {
            engine,
            network: Some(true),
            postpone: Duration::from_secs(24 * 3600),
            free_space: u64::MAX,
            require_setup: false,
        }
    }

    pub fn network(mut self, connected: Option<bool>) -> Self {
        self.network = connected;
        self
    }

    pub fn postpone(mut self, delay: Duration) -> Self {
        self.postpone = delay;
        self
    }

    pub fn free_space(mut self, bytes: u64) -> Self {
        self.free_space = bytes;
        self
    }

    /// Prompt only once `Harness::finish_setup` was called
    pub fn require_setup(mut self) -> Self {
        self.require_setup = true;
        self
    }

    pub fn start(self) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path()).with_postpone_delay(self.postpone);
        if self.require_setup {
            config = config.with_setup_done_marker(tmp.path().join("setup-done"));
        }
        std::fs::create_dir_all(config.cache_dir()).unwrap();

        let engine = Arc::new(self.engine);
        let presentation = Arc::new(RecordingPresentation::default());
        let installer = Arc::new(RecordingInstaller::default());
        let power = Arc::new(CountingPower::default());
        let network = self.network.map(|connected| {
            Arc::new(FakeNetwork(AtomicBool::new(connected))) as Arc<dyn NetworkMonitor>
        });

        let collaborators = Collaborators {
            engine: engine.clone(),
            presentation: presentation.clone(),
            installer: installer.clone(),
            network,
            power: Some(power.clone()),
            space: Arc::new(FixedProbe(self.free_space)),
        };

        let dispatcher =
            Dispatcher::launch(config.clone(), collaborators, tokio::runtime::Handle::current())
                .unwrap();

        Harness {
            engine,
            presentation,
            installer,
            power,
            config,
            tmp,
            dispatcher,
        }
    }
}

impl Harness {
    pub fn events(&self) -> EventSender {
        self.dispatcher.events()
    }

    pub fn submit(&self, event: Event) {
        self.dispatcher.submit(event).unwrap();
    }

    /// State after everything submitted so far was handled
    pub async fn state(&self) -> SupervisorState {
        self.events().snapshot().await.unwrap()
    }

    /// Poll the state until `cond` holds, panicking after a few seconds
    pub async fn wait_for<F>(&self, what: &str, cond: F) -> SupervisorState
    where
        F: Fn(&SupervisorState) -> bool,
    {
        for _ in 0..500 {
            let state = self.state().await;
            if cond(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Poll the presentation log until `cond` holds
    pub async fn wait_shown<F>(&self, what: &str, cond: F)
    where
        F: Fn(&[PresentationCommand]) -> bool,
    {
        for _ in 0..500 {
            if cond(&self.presentation.shown()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {what}, shown: {:?}",
            self.presentation.shown()
        );
    }

    pub fn artifact(&self) -> PathBuf {
        self.config.install_dir().join(self.config.artifact_name())
    }

    pub fn stage_artifact(&self) {
        std::fs::create_dir_all(self.config.install_dir()).unwrap();
        std::fs::write(self.artifact(), "update").unwrap();
    }

    pub fn finish_setup(&self) {
        std::fs::write(self.tmp.path().join("setup-done"), "").unwrap();
    }

    pub fn stop(self) {
        self.dispatcher.shutdown().unwrap();
    }
}
