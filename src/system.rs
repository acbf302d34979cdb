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

//! System bus backed implementations of the collaborator traits.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use log::{debug, error, info, warn};
use zbus::blocking::Connection;
use zbus::zvariant::OwnedFd;

use crate::engine::{Installer, NetworkMonitor, PowerManager, UpdateEngine};
use crate::state::UpdateInfo;
use crate::status::StatusCode;
use crate::ServiceError;

/// Reported as download status when the engine can't be reached
pub const ENGINE_UNREACHABLE: StatusCode = -2;

/// `NM_STATE_CONNECTED_GLOBAL`
const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

#[zbus::proxy(
    interface = "org.otavisor.Engine1",
    default_service = "org.otavisor.Engine",
    default_path = "/org/otavisor/Engine"
)]
trait Engine {
    fn shared_lib_version(&self) -> zbus::Result<String>;
    fn private_lib_version(&self) -> zbus::Result<String>;
    fn build_variant(&self) -> zbus::Result<String>;
    fn check_ota_available(&self) -> zbus::Result<i32>;
    fn check_media_available(&self, path: &str) -> zbus::Result<i32>;
    fn is_current_update_optional(&self) -> zbus::Result<bool>;
    fn is_loop_test_mode(&self) -> zbus::Result<bool>;

    /// (headline, version, description, kind)
    fn update_info(&self) -> zbus::Result<(String, String, String, String)>;

    fn start_scheduled_download(&self) -> zbus::Result<()>;
    fn download_status_code(&self) -> zbus::Result<i32>;
    fn download_percent(&self) -> zbus::Result<i32>;
    fn is_ready_to_install(&self) -> zbus::Result<bool>;
    fn set_ready_to_install(&self, ready: bool) -> zbus::Result<()>;
    fn set_install_path(&self, path: &str) -> zbus::Result<()>;
    fn on_network_up(&self) -> zbus::Result<()>;
    fn on_pre_shutdown(&self) -> zbus::Result<()>;
    fn on_force_server_contact(&self) -> zbus::Result<()>;
    fn abort(&self) -> zbus::Result<()>;
    fn current_status_code(&self) -> zbus::Result<i32>;
    fn message_for_code(&self, code: i32) -> zbus::Result<String>;
    fn agent_info(&self, keys: &[String]) -> zbus::Result<Vec<String>>;
    fn insert_provisioning_key(&self, key: &[u8]) -> zbus::Result<i32>;
    fn manage_reg_store(&self, values: &[String]) -> zbus::Result<i32>;
}

#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManager {
    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;
}

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait Logind {
    fn inhibit(&self, what: &str, who: &str, why: &str, mode: &str) -> zbus::Result<OwnedFd>;
}

fn or_neutral<T: Default>(call: &str, result: zbus::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("Engine call {call} failed: {e}");
            T::default()
        }
    }
}

/// The engine sends update info as (headline, version, description, kind)
fn update_info_from_wire(wire: (String, String, String, String)) -> UpdateInfo {
    let (headline, version, description, kind) = wire;
    UpdateInfo {
        version,
        headline,
        description,
        kind,
    }
}

/// Update engine reached over the system bus
pub struct DBusEngine {
    proxy: EngineProxyBlocking<'static>,
}

impl DBusEngine {
    pub fn new(connection: &Connection) -> Result<Self, ServiceError> {
        Ok(Self {
            proxy: EngineProxyBlocking::new(connection)?,
        })
    }
}

impl UpdateEngine for DBusEngine {
    fn shared_lib_version(&self) -> String {
        or_neutral("SharedLibVersion", self.proxy.shared_lib_version())
    }

    fn private_lib_version(&self) -> String {
        or_neutral("PrivateLibVersion", self.proxy.private_lib_version())
    }

    fn build_variant(&self) -> String {
        or_neutral("BuildVariant", self.proxy.build_variant())
    }

    fn check_ota_available(&self) -> i32 {
        or_neutral("CheckOtaAvailable", self.proxy.check_ota_available())
    }

    fn check_media_available(&self, path: &Path) -> i32 {
        or_neutral(
            "CheckMediaAvailable",
            self.proxy.check_media_available(&path.to_string_lossy()),
        )
    }

    fn is_current_update_optional(&self) -> bool {
        // An unreachable engine shouldn't turn every update mandatory
        match self.proxy.is_current_update_optional() {
            Ok(optional) => optional,
            Err(e) => {
                error!("Engine call IsCurrentUpdateOptional failed: {e}");
                true
            }
        }
    }

    fn is_loop_test_mode(&self) -> bool {
        or_neutral("IsLoopTestMode", self.proxy.is_loop_test_mode())
    }

    fn update_info(&self) -> UpdateInfo {
        update_info_from_wire(or_neutral("UpdateInfo", self.proxy.update_info()))
    }

    fn start_scheduled_download(&self) {
        or_neutral("StartScheduledDownload", self.proxy.start_scheduled_download())
    }

    fn download_status_code(&self) -> StatusCode {
        match self.proxy.download_status_code() {
            Ok(code) => code,
            Err(e) => {
                error!("Engine call DownloadStatusCode failed: {e}");
                ENGINE_UNREACHABLE
            }
        }
    }

    fn download_percent(&self) -> i32 {
        or_neutral("DownloadPercent", self.proxy.download_percent())
    }

    fn is_ready_to_install(&self) -> bool {
        or_neutral("IsReadyToInstall", self.proxy.is_ready_to_install())
    }

    fn set_ready_to_install(&self, ready: bool) {
        or_neutral("SetReadyToInstall", self.proxy.set_ready_to_install(ready))
    }

    fn set_install_path(&self, path: &Path) {
        or_neutral(
            "SetInstallPath",
            self.proxy.set_install_path(&path.to_string_lossy()),
        )
    }

    fn on_network_up(&self) {
        or_neutral("OnNetworkUp", self.proxy.on_network_up())
    }

    fn on_pre_shutdown(&self) {
        or_neutral("OnPreShutdown", self.proxy.on_pre_shutdown())
    }

    fn on_force_server_contact(&self) {
        or_neutral("OnForceServerContact", self.proxy.on_force_server_contact())
    }

    fn abort(&self) {
        or_neutral("Abort", self.proxy.abort())
    }

    fn current_status_code(&self) -> StatusCode {
        match self.proxy.current_status_code() {
            Ok(code) => code,
            Err(e) => {
                error!("Engine call CurrentStatusCode failed: {e}");
                ENGINE_UNREACHABLE
            }
        }
    }

    fn message_for_code(&self, code: StatusCode) -> String {
        match self.proxy.message_for_code(code) {
            Ok(message) => message,
            Err(e) => {
                error!("Engine call MessageForCode failed: {e}");
                format!("update engine error {code}")
            }
        }
    }

    fn agent_info(&self, keys: &[String]) -> Vec<String> {
        match self.proxy.agent_info(keys) {
            Ok(values) => values,
            Err(e) => {
                error!("Engine call AgentInfo failed: {e}");
                vec![String::new(); keys.len()]
            }
        }
    }

    fn insert_provisioning_key(&self, key: &[u8]) -> StatusCode {
        match self.proxy.insert_provisioning_key(key) {
            Ok(code) => code,
            Err(e) => {
                error!("Engine call InsertProvisioningKey failed: {e}");
                ENGINE_UNREACHABLE
            }
        }
    }

    fn manage_reg_store(&self, values: &[String]) -> StatusCode {
        match self.proxy.manage_reg_store(values) {
            Ok(code) => code,
            Err(e) => {
                error!("Engine call ManageRegStore failed: {e}");
                ENGINE_UNREACHABLE
            }
        }
    }
}

/// Link state from NetworkManager
pub struct NetworkManagerMonitor {
    proxy: NetworkManagerProxyBlocking<'static>,
}

impl NetworkManagerMonitor {
    pub fn new(connection: &Connection) -> Result<Self, ServiceError> {
        Ok(Self {
            proxy: NetworkManagerProxyBlocking::new(connection)?,
        })
    }
}

impl NetworkMonitor for NetworkManagerMonitor {
    fn is_connected(&self) -> bool {
        match self.proxy.state() {
            Ok(state) => {
                debug!("NetworkManager state {state}");
                state == NM_STATE_CONNECTED_GLOBAL
            }
            Err(e) => {
                warn!("Couldn't read the NetworkManager state: {e}");
                false
            }
        }
    }
}

/// Sleep inhibitor lock taken through logind
pub struct LogindPower {
    proxy: LogindProxyBlocking<'static>,
    inhibitor: Mutex<Option<OwnedFd>>,
}

impl LogindPower {
    pub fn new(connection: &Connection) -> Result<Self, ServiceError> {
        Ok(Self {
            proxy: LogindProxyBlocking::new(connection)?,
            inhibitor: Mutex::new(None),
        })
    }
}

impl PowerManager for LogindPower {
    fn acquire_wake_lock(&self) {
        let fd = match self
            .proxy
            .inhibit("sleep:idle", "otavisor", "Downloading a system update", "block")
        {
            Ok(fd) => fd,
            Err(e) => {
                warn!("Couldn't take the sleep inhibitor: {e}");
                return;
            }
        };

        match self.inhibitor.lock() {
            Ok(mut slot) => *slot = Some(fd),
            Err(e) => error!("Sleep inhibitor slot poisoned: {e}"),
        }
    }

    fn release_wake_lock(&self) {
        match self.inhibitor.lock() {
            // closing the fd releases the inhibitor
            Ok(mut slot) => drop(slot.take()),
            Err(e) => error!("Sleep inhibitor slot poisoned: {e}"),
        }
    }
}

/// Hands the staged artifact to an external command
pub struct CommandInstaller {
    command: Vec<String>,
}

impl CommandInstaller {
    pub fn new(command: &[String]) -> Self {
        Self {
            command: command.to_vec(),
        }
    }
}

impl Installer for CommandInstaller {
    fn install_package(&self, artifact: &Path) -> Result<(), ServiceError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ServiceError::InstallError(
                "no install command configured".to_string(),
            ));
        };

        info!("Running {program} on {}", artifact.display());
        let status = Command::new(program).args(args).arg(artifact).status()?;

        if !status.success() {
            return Err(ServiceError::InstallError(format!(
                "{program} exited with {status}"
            )));
        }

        Ok(())
    }
}
