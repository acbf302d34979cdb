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

//! Collaborators the supervisor core drives but does not implement.
//!
//! Every call here is blocking. Engine queries have no failure contract:
//! implementations are expected to log transport problems and answer with
//! a neutral value. The install handoff is the only fallible operation.

use std::path::Path;

use log::{debug, info, warn};

use crate::state::UpdateInfo;
use crate::status::{StatusCode, STATUS_IN_PROGRESS};
use crate::ServiceError;

/// Blocking client of the update engine
pub trait UpdateEngine: Send + Sync {
    fn shared_lib_version(&self) -> String;

    fn private_lib_version(&self) -> String;

    fn build_variant(&self) -> String;

    /// Number of OTA updates currently available
    fn check_ota_available(&self) -> i32;

    /// Number of usable updates found on the media mounted at `path`
    fn check_media_available(&self, path: &Path) -> i32;

    fn is_current_update_optional(&self) -> bool;

    fn is_loop_test_mode(&self) -> bool;

    fn update_info(&self) -> UpdateInfo;

    fn start_scheduled_download(&self);

    fn download_status_code(&self) -> StatusCode;

    /// Percent complete of the running download, 0 to 100
    fn download_percent(&self) -> i32;

    fn is_ready_to_install(&self) -> bool;

    fn set_ready_to_install(&self, ready: bool);

    fn set_install_path(&self, path: &Path);

    fn on_network_up(&self);

    fn on_pre_shutdown(&self);

    fn on_force_server_contact(&self);

    /// Ask the engine to abort the running operation
    fn abort(&self);

    fn current_status_code(&self) -> StatusCode;

    fn message_for_code(&self, code: StatusCode) -> String;

    /// Values for the requested agent info keys, in the same order
    fn agent_info(&self, keys: &[String]) -> Vec<String>;

    fn insert_provisioning_key(&self, key: &[u8]) -> StatusCode;

    /// Hand registration store values to the engine
    fn manage_reg_store(&self, values: &[String]) -> StatusCode;
}

/// Engine versions shown in the device info report
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineVersions {
    pub library: String,
    pub private_library: String,
    pub build_variant: String,
}

impl EngineVersions {
    pub fn query(engine: &dyn UpdateEngine) -> Self {
        Self {
            library: engine.shared_lib_version(),
            private_library: engine.private_lib_version(),
            build_variant: engine.build_variant(),
        }
    }
}

/// External "apply update and restart" primitive
pub trait Installer: Send + Sync {
    fn install_package(&self, artifact: &Path) -> Result<(), ServiceError>;
}

/// Source of the current link state
pub trait NetworkMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
}

/// Keeps the system awake while held
pub trait PowerManager: Send + Sync {
    fn acquire_wake_lock(&self);

    fn release_wake_lock(&self);
}

/// Scoped wake lock: released exactly once, when dropped.
pub struct WakeLockGuard<'a> {
    power: &'a dyn PowerManager,
}

impl<'a> WakeLockGuard<'a> {
    pub fn acquire(power: &'a dyn PowerManager) -> Self {
        debug!("Acquiring wake lock");
        power.acquire_wake_lock();
        Self { power }
    }
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        debug!("Releasing wake lock");
        self.power.release_wake_lock();
    }
}

/// Hand the transit provisioning key at `path` to the engine, if present.
///
/// Returns the engine status, or `None` when there is no key file. The file
/// is left in place.
pub fn insert_provisioning_key(
    engine: &dyn UpdateEngine,
    path: &Path,
) -> Result<Option<StatusCode>, ServiceError> {
    if !path.exists() {
        debug!("No provisioning key at {}", path.display());
        return Ok(None);
    }

    let key = std::fs::read(path)?;
    let status = engine.insert_provisioning_key(&key);
    if status == STATUS_IN_PROGRESS {
        info!("Provisioning key from {} inserted", path.display());
    } else {
        warn!(
            "Provisioning key insertion failed with status {status}: {}",
            engine.message_for_code(status)
        );
    }

    Ok(Some(status))
}
