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

pub extern crate zbus;

pub mod cache;
pub mod check;
pub mod config;
pub mod dbus;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod presentation;
pub mod state;
pub mod status;
pub mod system;
pub mod timer;
pub mod worker;

use zbus::Error as ZError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Permission error: not running as the root user")]
    MissingPrivilegesError,

    #[error("Missing configuration: couldn't find the required file or directory")]
    MissingConfigurationError(std::path::PathBuf),

    #[error("Download worker already started")]
    WorkerAlreadyStarted,

    #[error("Dispatcher is not accepting events anymore")]
    DispatcherClosed,

    #[error("Install handoff failed: {0}")]
    InstallError(String),

    #[error("DBus error: {0}")]
    ZbusError(#[from] ZError),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Failed to deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}
