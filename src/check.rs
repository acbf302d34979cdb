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

use log::{debug, error, info};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::engine::UpdateEngine;
use crate::event::{Event, EventSender, UpdateCheckResult};
use crate::status::STATUS_TASK_FAILED;

/// A user-driven update check running in the background.
///
/// The engine calls run on the blocking pool; the result comes back to the
/// dispatcher as `Event::UpdateCheckFinished`. Cancelling drops the result
/// on the floor, nothing of it is ever applied.
pub struct UpdateCheck {
    generation: u64,
    token: CancellationToken,
}

impl UpdateCheck {
    pub fn spawn(
        runtime: &Handle,
        engine: Arc<dyn UpdateEngine>,
        events: EventSender,
        generation: u64,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        runtime.spawn(async move {
            let probe = tokio::task::spawn_blocking(move || {
                engine.on_force_server_contact();
                let available = engine.check_ota_available() > 0;
                UpdateCheckResult {
                    available,
                    mandatory: !engine.is_current_update_optional(),
                    loop_test: engine.is_loop_test_mode(),
                    status: engine.current_status_code(),
                }
            });

            let result = tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("Update check #{generation} cancelled, dropping its result");
                    return;
                }
                joined = probe => match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Update check #{generation} failed: {e}");
                        UpdateCheckResult {
                            available: false,
                            mandatory: false,
                            loop_test: false,
                            status: STATUS_TASK_FAILED,
                        }
                    }
                },
            };

            // A cancel racing with completion still wins
            if cancelled.is_cancelled() {
                return;
            }

            info!("Update check #{generation} done: available={}", result.available);
            if let Err(e) = events.submit(Event::UpdateCheckFinished { generation, result }) {
                error!("Couldn't deliver update check result: {e}");
            }
        });

        Self { generation, token }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}
