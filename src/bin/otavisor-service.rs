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

use std::sync::Arc;

use log::{error, info, warn};
use otavisor::{
    cache::StatvfsProbe,
    config::Config,
    dbus::{self, DBusPresentation, SupervisorDBus},
    dispatcher::{Collaborators, Dispatcher, DispatcherHandle},
    engine::{self, EngineVersions, NetworkMonitor, PowerManager, UpdateEngine},
    system::{CommandInstaller, DBusEngine, LogindPower, NetworkManagerMonitor},
    ServiceError,
};
use tokio::signal::unix::{signal, SignalKind};
use zbus::connection;

struct Started {
    dispatcher: DispatcherHandle,
    versions: EngineVersions,
}

/// Everything here blocks on the system bus, keep it off the async workers
fn start_dispatcher(
    config: Config,
    bus: zbus::blocking::Connection,
    presentation: DBusPresentation,
) -> Result<Started, ServiceError> {
    let engine: Arc<dyn UpdateEngine> = Arc::new(DBusEngine::new(&bus)?);

    let versions = EngineVersions::query(engine.as_ref());
    info!(
        "Update engine library {} (private {}), build variant {}",
        versions.library, versions.private_library, versions.build_variant
    );

    if let Some(key_path) = config.provisioning_key_path() {
        if let Err(e) = engine::insert_provisioning_key(engine.as_ref(), key_path) {
            warn!("Couldn't read provisioning key {}: {e}", key_path.display());
        }
    }

    let network: Option<Arc<dyn NetworkMonitor>> = match NetworkManagerMonitor::new(&bus) {
        Ok(monitor) => Some(Arc::new(monitor)),
        Err(e) => {
            warn!("NetworkManager unavailable, connectivity will be unknown: {e}");
            None
        }
    };

    let power: Option<Arc<dyn PowerManager>> = match LogindPower::new(&bus) {
        Ok(power) => Some(Arc::new(power)),
        Err(e) => {
            warn!("logind unavailable, downloads won't inhibit sleep: {e}");
            None
        }
    };

    let collaborators = Collaborators {
        engine,
        presentation: Arc::new(presentation),
        installer: Arc::new(CommandInstaller::new(config.install_command())),
        network,
        power,
        space: Arc::new(StatvfsProbe),
    };

    let dispatcher = Dispatcher::launch(config, collaborators, tokio::runtime::Handle::current())?;

    Ok(Started { dispatcher, versions })
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    if users::get_current_uid() != 0 {
        error!("Application started without root privileges: aborting...");
        return Err(ServiceError::MissingPrivilegesError);
    }

    let cfg_path = match std::fs::exists("/usr/share/otavisor/config.json").unwrap_or(false) {
        true => std::path::PathBuf::from("/usr/share/otavisor/config.json"),
        false => std::path::PathBuf::from("/etc/otavisor/config.json"),
    };
    let config = match Config::load_from(cfg_path) {
        Ok(cfg) => {
            info!("Loaded configuration");
            cfg
        }
        Err(ServiceError::MissingConfigurationError(path)) => {
            warn!("Configuration not found at {:?}, continuing with defaults", path);
            Config::default()
        }
        Err(e) => return Err(e),
    };

    let bus = zbus::Connection::system().await?;
    let (presentation, presentation_rx) = DBusPresentation::channel();

    let blocking_bus = zbus::blocking::Connection::from(bus.clone());
    let started =
        tokio::task::spawn_blocking(move || start_dispatcher(config, blocking_bus, presentation)).await??;

    info!("Building the dbus object...");

    let dbus_manager = connection::Builder::system()?
        .name(dbus::SERVICE_NAME)?
        .serve_at(
            dbus::OBJECT_PATH,
            SupervisorDBus::new(started.dispatcher.events(), started.versions),
        )?
        .build()
        .await?;

    let interface_ref = dbus_manager
        .object_server()
        .interface::<_, SupervisorDBus>(dbus::OBJECT_PATH)
        .await?;
    let signal_emitter = interface_ref.signal_emitter().clone();
    tokio::spawn(dbus::forward_presentation(presentation_rx, signal_emitter));

    info!("Application running");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    info!("Termination signal received, shutting down...");
    drop(dbus_manager);

    let dispatcher = started.dispatcher;
    tokio::task::spawn_blocking(move || dispatcher.shutdown()).await??;

    Ok(())
}
