//! Commander against the simulated controller: one request in flight,
//! bounded retries, epoch isolation and failure of pending work.

use futures_lite::future;

use sparkhost::error::CommandError;
use sparkhost::fsm::ConnectionState;
use sparkhost::rpc::command::{Command, ErrorCode, Opcode};
use sparkhost::rpc::commander::FrameDisposition;
use sparkhost::rpc::sim::SimTransport;

use crate::harness::Rig;

/// Open a session and mark it ready without synchronizing.
fn raw_ready<T>(rig: &Rig, body: impl AsyncFnOnce() -> T) -> T {
    rig.session(|epoch| async move {
        rig.commander.mark_ready(epoch).unwrap();
        body().await
    })
    .expect("session ended early")
}

// ── Ordering ─────────────────────────────────────────────────

#[test]
fn never_more_than_one_request_on_the_wire() {
    let rig = &Rig::new();
    rig.sim.set_latency(3);

    let results = raw_ready(rig, async || {
        let c = &rig.commander;
        let ((a, b), (d, e)) = future::zip(
            future::zip(c.submit(Command::read(2)), c.submit(Command::read_all())),
            future::zip(c.submit(Command::read(3)), c.submit(Command::read(4))),
        )
        .await;
        [a, b, d, e]
    });

    assert!(results.iter().all(Result::is_ok), "{results:?}");
    assert_eq!(rig.sim.max_outstanding(), 1);
    assert_eq!(rig.commander.pending(), 0);
}

#[test]
fn responses_reach_the_matching_caller() {
    let rig = &Rig::new();
    let (first, second) = raw_ready(rig, async || {
        future::zip(
            rig.commander.submit(Command::read(2)),
            rig.commander.submit(Command::read(3)),
        )
        .await
    });
    assert_eq!(first.unwrap().objects[0].nid, 2);
    assert_eq!(second.unwrap().objects[0].nid, 3);
}

// ── Retries ──────────────────────────────────────────────────

#[test]
fn silent_controller_exhausts_exactly_the_retry_budget() {
    let rig = &Rig::new();
    let (result, requests) = raw_ready(rig, async || {
        rig.sim.set_mute(true);
        let before = rig.sim.requests();
        let result = rig.commander.submit(Command::read_all()).await;
        (result, rig.sim.requests() - before)
    });

    let attempts = rig.config.retry_limit + 1;
    assert_eq!(
        result.unwrap_err(),
        CommandError::Timeout {
            opcode: Opcode::BlockReadAll,
            attempts
        }
    );
    assert_eq!(requests, u64::from(attempts));
    let diag = rig.commander.diagnostics();
    assert_eq!(diag.retries, u64::from(rig.config.retry_limit));
    assert_eq!(diag.timeouts, 1);
}

#[test]
fn dropped_request_is_retried_and_answered() {
    let rig = &Rig::new();
    let result = raw_ready(rig, async || {
        rig.sim.drop_next(1);
        rig.commander.submit(Command::read(2)).await
    });
    assert!(result.is_ok());
    assert_eq!(rig.commander.diagnostics().retries, 1);
}

#[test]
fn corrupt_response_is_counted_then_retried() {
    let rig = &Rig::new();
    let result = raw_ready(rig, async || {
        rig.sim.corrupt_next(1);
        rig.commander.submit(Command::read(2)).await
    });
    assert!(result.is_ok());
    let diag = rig.commander.diagnostics();
    assert_eq!(diag.frames_corrupt, 1);
    assert_eq!(diag.retries, 1);
}

#[test]
fn duplicate_response_is_discarded() {
    let rig = &Rig::new();
    let (first, second) = raw_ready(rig, async || {
        rig.sim.duplicate_next(1);
        let first = rig.commander.submit(Command::read(2)).await;
        let second = rig.commander.submit(Command::read(3)).await;
        (first, second)
    });
    assert_eq!(first.unwrap().objects[0].nid, 2);
    assert_eq!(second.unwrap().objects[0].nid, 3);
    assert_eq!(rig.commander.diagnostics().responses_unexpected, 1);
}

#[test]
fn rejection_is_surfaced_without_retry() {
    let rig = &Rig::new();
    let result = raw_ready(rig, async || rig.commander.submit(Command::read(999)).await);
    assert_eq!(
        result.unwrap_err(),
        CommandError::Rejected {
            opcode: Opcode::BlockRead,
            code: ErrorCode::InvalidBlockId
        }
    );
    assert_eq!(rig.commander.diagnostics().retries, 0);
}

// ── Connection loss and epochs ───────────────────────────────

#[test]
fn lost_connection_fails_pending_requests() {
    let rig = &Rig::new();
    rig.commander.begin_connecting().unwrap();
    let epoch = rig.commander.open_session().unwrap();
    rig.commander.mark_ready(epoch).unwrap();
    rig.sim.set_mute(true);
    let transport = SimTransport::connect(&rig.sim);

    let result = future::block_on(future::or(
        async {
            rig.commander.run_session(epoch, transport).await;
            rig.commander.connection_lost(epoch);
            future::pending().await
        },
        async {
            let submitted = rig.commander.submit(Command::read_all());
            let pull_cable = async {
                rig.sim.disconnect();
                future::pending().await
            };
            future::or(submitted, pull_cable).await
        },
    ));

    assert_eq!(result.unwrap_err(), CommandError::ConnectionLost);
    assert_eq!(rig.commander.state(), ConnectionState::Disconnected);
    assert_eq!(rig.commander.pending(), 0);
}

#[test]
fn submissions_outside_ready_are_refused() {
    let rig = &Rig::new();
    let refused = future::block_on(rig.commander.submit(Command::read_all()));
    assert_eq!(
        refused.unwrap_err(),
        CommandError::NotReady(ConnectionState::Disconnected)
    );

    let during_sync = rig
        .session(|_| async { rig.commander.submit(Command::read_all()).await })
        .unwrap();
    assert_eq!(
        during_sync.unwrap_err(),
        CommandError::NotReady(ConnectionState::Synchronizing)
    );
}

#[test]
fn response_from_previous_epoch_is_stale() {
    let rig = &Rig::new();
    let (old_epoch, payload) = raw_ready(rig, async || {
        let response = rig.commander.submit(Command::read(2)).await.unwrap();
        (rig.commander.epoch(), response.encode())
    });

    let disposition = rig
        .session(|epoch| async move {
            assert!(epoch > old_epoch);
            rig.commander.on_frame(old_epoch, &payload)
        })
        .unwrap();
    assert_eq!(disposition, FrameDisposition::Stale);
    assert_eq!(rig.commander.diagnostics().responses_stale, 1);
}

#[test]
fn each_session_starts_a_new_epoch() {
    let rig = &Rig::new();
    let first = rig.session(|epoch| async move { epoch }).unwrap();
    let second = rig.session(|epoch| async move { epoch }).unwrap();
    assert_eq!(second, first + 1);
    assert_eq!(rig.commander.diagnostics().connections, 2);
}
