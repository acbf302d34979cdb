use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ServiceError;

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default)]
pub struct Config {
    install_dir: PathBuf,
    artifact_name: String,
    sentinel_name: String,
    cache_dir: PathBuf,
    fallback_install_dir: PathBuf,

    default_media_root: String,

    postpone_ms: u64,
    poll_interval_ms: u64,

    default_update_size: u64,
    space_margin: u64,

    provisioning_key_path: Option<PathBuf>,
    install_command: Vec<String>,

    /// File created once the first-boot device setup is done. While it is
    /// missing no update is prompted. `None` means the device is always
    /// considered set up.
    setup_done_marker: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/cache/otavisor/"),
            artifact_name: String::from("update.zip"),
            sentinel_name: String::from("otavisor.txt"),
            cache_dir: PathBuf::from("/cache"),
            fallback_install_dir: PathBuf::from("/mnt/sdcard/"),
            default_media_root: String::from("file:///mnt/sdcard"),
            postpone_ms: 24 * 3600 * 1000,
            poll_interval_ms: 200,
            default_update_size: 252_551_744,
            space_margin: 1024,
            provisioning_key_path: None,
            install_command: vec![String::from("/usr/sbin/otavisor-apply")],
            setup_done_marker: None,
        }
    }
}

impl Config {
    /// Parse from a JSON string.
    pub fn new(json_str: &str) -> Result<Self, ServiceError> {
        let cfg: Self = serde_json::from_str(json_str)?;
        Ok(cfg)
    }

    /// Read and parse configuration from the given file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)?;
        let cfg = Self::new(&s)?;
        Ok(cfg)
    }

    /// Load configuration from the provided path.
    pub fn load_from(path: PathBuf) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::MissingConfigurationError(path));
        }
        Self::from_file(path)
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    pub fn sentinel_name(&self) -> &str {
        &self.sentinel_name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn fallback_install_dir(&self) -> &Path {
        &self.fallback_install_dir
    }

    pub fn default_media_root(&self) -> &str {
        &self.default_media_root
    }

    pub fn postpone_delay(&self) -> Duration {
        Duration::from_millis(self.postpone_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_update_size(&self) -> u64 {
        self.default_update_size
    }

    pub fn space_margin(&self) -> u64 {
        self.space_margin
    }

    pub fn provisioning_key_path(&self) -> Option<&Path> {
        self.provisioning_key_path.as_deref()
    }

    pub fn install_command(&self) -> &[String] {
        &self.install_command
    }

    pub fn setup_done_marker(&self) -> Option<&Path> {
        self.setup_done_marker.as_deref()
    }

    // Builder-style overrides, mostly useful to point a config at scratch
    // directories and shorten delays.

    pub fn with_install_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.install_dir = dir.into();
        self
    }

    pub fn with_cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_fallback_install_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.fallback_install_dir = dir.into();
        self
    }

    pub fn with_postpone_delay(mut self, delay: Duration) -> Self {
        self.postpone_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_setup_done_marker<P: Into<PathBuf>>(mut self, marker: P) -> Self {
        self.setup_done_marker = Some(marker.into());
        self
    }
}
