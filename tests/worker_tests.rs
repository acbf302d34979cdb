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

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{ready, step, CountingPower, FakeEngine, RecordingPresentation};
use otavisor::dbus::PresentationCommand;
use otavisor::engine::UpdateEngine;
use otavisor::event::{self, DownloadOutcome, Event, EventReceiver};
use otavisor::status::{ErrorClass, STATUS_TASK_FAILED};
use otavisor::worker::{DownloadWorker, WorkerState};
use otavisor::ServiceError;
use tokio::runtime::Handle;

struct Setup {
    engine: Arc<FakeEngine>,
    worker: Arc<DownloadWorker>,
    presentation: Arc<RecordingPresentation>,
    power: Arc<CountingPower>,
    rx: EventReceiver,
}

fn setup(engine: FakeEngine, attached: bool) -> Setup {
    let (events, rx) = event::channel();
    let presentation = Arc::new(RecordingPresentation::default());
    let power = Arc::new(CountingPower::default());
    let engine = Arc::new(engine);

    let worker = Arc::new(DownloadWorker::new(
        engine.clone(),
        events,
        Some(power.clone()),
        Duration::from_millis(1),
    ));
    if attached {
        worker.set_presentation_handle(Some(presentation.clone()));
    }

    Setup {
        engine,
        worker,
        presentation,
        power,
        rx,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_then_completion() {
    let engine = FakeEngine::new().with_download(&[step(0, 10), step(0, 55), ready(100)]);
    let mut s = setup(engine, true);

    let outcome = s.worker.start(&Handle::current()).unwrap().await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Complete);
    assert_eq!(s.worker.state(), WorkerState::Complete);
    assert_eq!(s.presentation.progress(), vec![10, 55, 100]);
    assert_eq!(
        s.presentation.shown().last(),
        Some(&PresentationCommand::DownloadComplete)
    );

    assert!(matches!(
        s.rx.recv().await,
        Some(Event::DownloadFinished(DownloadOutcome::Complete))
    ));
    // a screen saw the result, nobody needs to be brought forward
    assert!(s.rx.try_recv().is_err());

    assert_eq!(s.power.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(s.power.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_completion_code_ends_the_download() {
    let engine = FakeEngine::new().with_download(&[step(0, 30), step(114, 100)]);
    let s = setup(engine, true);

    let outcome = s.worker.start(&Handle::current()).unwrap().await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Complete);
    assert_eq!(s.presentation.progress(), vec![30, 100]);
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_never_goes_backwards() {
    let engine = FakeEngine::new().with_download(&[
        step(0, 30),
        step(0, 20),
        step(0, 30),
        step(0, 40),
        step(0, 140),
        ready(100),
    ]);
    let s = setup(engine, true);

    s.worker.start(&Handle::current()).unwrap().await.unwrap();

    assert_eq!(s.presentation.progress(), vec![30, 40, 100]);
    assert_eq!(s.worker.progress(), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_failure_is_reported_to_the_screen() {
    let engine = FakeEngine::new().with_download(&[step(0, 5), step(155, 5)]);
    let mut s = setup(engine, true);

    let outcome = s.worker.start(&Handle::current()).unwrap().await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Failed(155));
    assert_eq!(s.worker.state(), WorkerState::Failed(155));

    let errors = s.presentation.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].class, ErrorClass::Connection);
    assert!(errors[0].offers_retry());

    assert!(matches!(
        s.rx.recv().await,
        Some(Event::DownloadFinished(DownloadOutcome::Failed(155)))
    ));
    assert_eq!(s.power.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unattended_failure_asks_for_the_screen() {
    let engine = FakeEngine::new().with_download(&[step(42, 0)]);
    let mut s = setup(engine, false);

    s.worker.start(&Handle::current()).unwrap().await.unwrap();

    assert!(s.presentation.shown().is_empty());
    assert!(matches!(
        s.rx.recv().await,
        Some(Event::DownloadFinished(DownloadOutcome::Failed(42)))
    ));
    assert!(matches!(s.rx.recv().await, Some(Event::BringToFront)));
}

#[tokio::test(flavor = "multi_thread")]
async fn abort_shows_nothing() {
    let engine = FakeEngine::new().with_download(&[step(0, 50), step(9, 50)]);
    let s = setup(engine, true);

    let outcome = s.worker.start(&Handle::current()).unwrap().await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Failed(9));
    assert!(s.presentation.errors().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_are_single_use() {
    let engine = FakeEngine::new().with_download(&[ready(100)]);
    let s = setup(engine, false);

    let first = s.worker.start(&Handle::current()).unwrap();
    assert!(matches!(
        s.worker.start(&Handle::current()),
        Err(ServiceError::WorkerAlreadyStarted)
    ));

    first.await.unwrap();
    assert!(matches!(
        s.worker.start(&Handle::current()),
        Err(ServiceError::WorkerAlreadyStarted)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn handle_can_be_attached_mid_download() {
    let engine = FakeEngine::new().with_download(&[
        step(0, 10),
        step(0, 20),
        step(0, 30),
        step(0, 40),
        step(0, 50),
        step(0, 60),
        step(0, 70),
        step(0, 80),
        ready(100),
    ]);
    let s = setup(engine, false);

    let join = s.worker.start(&Handle::current()).unwrap();
    s.worker.set_presentation_handle(Some(s.presentation.clone()));
    join.await.unwrap();

    // whatever was missed before attaching, the end is always seen
    assert_eq!(s.presentation.progress().last(), Some(&100));
    assert_eq!(
        s.presentation.shown().last(),
        Some(&PresentationCommand::DownloadComplete)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_abort_ends_the_loop() {
    let steps: Vec<_> = (0..1000).map(|i| step(0, i / 10)).collect();
    let mut s = setup(FakeEngine::new().with_download(&steps), true);

    let join = s.worker.start(&Handle::current()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    s.engine.abort();

    assert_eq!(join.await.unwrap(), DownloadOutcome::Failed(9));
    assert_eq!(s.worker.state(), WorkerState::Failed(9));
    assert!(s.presentation.errors().is_empty());
    assert!(matches!(
        s.rx.recv().await,
        Some(Event::DownloadFinished(DownloadOutcome::Failed(9)))
    ));
    assert_eq!(s.power.released.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_panic_still_finishes_the_run() {
    let mut s = setup(FakeEngine::new().panicking_download(), true);

    let join = s.worker.start(&Handle::current()).unwrap();
    assert!(join.await.unwrap_err().is_panic());

    assert_eq!(s.worker.state(), WorkerState::Failed(STATUS_TASK_FAILED));
    assert!(matches!(
        s.rx.recv().await,
        Some(Event::DownloadFinished(DownloadOutcome::Failed(STATUS_TASK_FAILED)))
    ));
    assert!(matches!(s.rx.recv().await, Some(Event::BringToFront)));
    assert_eq!(s.power.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(s.power.released.load(Ordering::SeqCst), 1);
}
