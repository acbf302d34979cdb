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

use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::event::{Event, EventSender};

/// One-shot timer ending a postponement.
///
/// Single slot: arming again aborts the pending task. Firing never touches
/// the state, it queues `Event::PostponeExpired` tagged with the generation
/// it was armed with so a late firing of a replaced timer can be told apart.
pub struct PostponeTimer {
    runtime: Handle,
    events: EventSender,
    delay: Duration,

    pending: Option<JoinHandle<()>>,
    generation: u64,
}

impl PostponeTimer {
    pub fn new(runtime: Handle, events: EventSender, delay: Duration) -> Self {
        Self {
            runtime,
            events,
            delay,
            pending: None,
            generation: 0,
        }
    }

    /// (Re)arm the timer, returning the new generation.
    pub fn arm(&mut self) -> u64 {
        self.cancel();

        self.generation += 1;
        let generation = self.generation;
        let delay = self.delay;
        let events = self.events.clone();

        debug!("Arming postpone timer #{generation} for {delay:?}");
        self.pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = events.submit(Event::PostponeExpired { generation }) {
                warn!("Postpone timer #{generation} fired but couldn't be delivered: {e}");
            }
        }));

        generation
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
            debug!("Postpone timer #{} cancelled", self.generation);
        }
    }

    /// Whether `generation` is the timer armed last
    pub fn is_current(&self, generation: u64) -> bool {
        self.pending.is_some() && generation == self.generation
    }

    /// Forget the slot once its expiry has been handled
    pub fn fired(&mut self) {
        self.pending = None;
    }
}
