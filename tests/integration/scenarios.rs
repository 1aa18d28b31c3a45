//! End-to-end controller scenarios against the scripted backend.

mod mock_api;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_test::{assert_err, assert_ok};

use automine::config::{ControllerConfig, IngestConfig};
use automine::controller::{MiningController, RoundOutcome, RunOutcome};
use automine::error::{ApiError, ControllerError, ErrorKind};
use automine::ingest::{EventIngestor, MiningEvent};
use automine::strategy::{self, Decision, EvalContext};
use automine::tracker::Ledger;
use automine::transport::{Endpoint, MiningApi, RawEvent, RetryPolicy};
use automine::types::{RoundSnapshot, SessionConfig, SessionState, TileChoice, TileSelection};

use mock_api::{loss, result, Call, ScriptedApi};

fn controller(api: &Arc<ScriptedApi>) -> MiningController<ScriptedApi> {
    MiningController::new(api.clone(), ControllerConfig::default())
}

fn round_start(round: u64, ev: Decimal) -> MiningEvent {
    MiningEvent::RoundStart(RoundSnapshot::new(round, ev))
}

fn round_end(result: automine::types::RoundResult) -> MiningEvent {
    MiningEvent::RoundEnd {
        result,
        reconstructed: false,
    }
}

fn spawn_ingestor(
    api: &Arc<ScriptedApi>,
) -> (
    mpsc::Receiver<MiningEvent>,
    tokio::task::JoinHandle<()>,
    watch::Sender<bool>,
) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dyn_api: Arc<dyn MiningApi> = api.clone();
    let (events, task) = EventIngestor::spawn(
        dyn_api,
        IngestConfig::default(),
        RetryPolicy::default(),
        shutdown_rx,
    );
    (events, task, shutdown_tx)
}

fn deployed_rounds(ctl: &MiningController<ScriptedApi>) -> Vec<u64> {
    ctl.notes()
        .iter()
        .filter(|n| matches!(n.outcome, RoundOutcome::Deployed { .. }))
        .map(|n| n.round)
        .collect()
}

#[tokio::test]
async fn test_happy_round() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    let cfg = SessionConfig::new(dec!(0.01), 25);
    ctl.start(cfg.clone()).await.unwrap();
    assert_eq!(ctl.state(), SessionState::Active);

    ctl.handle_event(round_start(100, dec!(5))).await;
    let mut won = result(100, true, dec!(0.01), dec!(0.019));
    won.ore_earned = dec!(0.5);
    ctl.handle_event(round_end(won)).await;

    let ledger = ctl.ledger();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger.aggregates().net_pnl_sol, dec!(0.009));
    assert_eq!(ledger.aggregates().win_count, 1);
    assert_eq!(ledger.aggregates().ore_earned, dec!(0.5));

    // Optimal tiles: a plain start without tile ids, nothing per round.
    assert_eq!(api.writes(), vec![Call::Start(cfg)]);
    assert_eq!(deployed_rounds(&ctl), vec![100]);
}

#[tokio::test]
async fn test_ev_skip_issues_no_write() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    let mut cfg = SessionConfig::new(dec!(0.01), 25);
    cfg.ev_threshold = dec!(10);
    cfg.auto_restart = false;
    ctl.start(cfg).await.unwrap();
    let writes_after_start = api.writes().len();

    ctl.handle_event(round_start(100, dec!(5))).await;
    ctl.handle_event(round_end(result(100, false, Decimal::ZERO, Decimal::ZERO)))
        .await;

    assert_eq!(api.writes().len(), writes_after_start);
    assert!(ctl.ledger().is_empty());
    let note = ctl.notes().back().unwrap();
    assert_eq!(note.round, 100);
    assert!(matches!(
        &note.outcome,
        RoundOutcome::Skipped { reason, .. } if reason == "ev_below_threshold"
    ));
}

#[tokio::test]
async fn test_loss_streak_pauses_before_next_round() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    let mut cfg = SessionConfig::new(dec!(0.01), 25);
    cfg.max_loss_streak = Some(3);
    ctl.start(cfg).await.unwrap();

    for round in 1..=3 {
        ctl.handle_event(round_start(round, dec!(5))).await;
        ctl.handle_event(round_end(loss(round))).await;
    }
    assert_eq!(ctl.state(), SessionState::PausedByRisk);
    assert_eq!(api.writes().last(), Some(&Call::Stop));
    assert!(api.session().is_none());

    ctl.handle_event(round_start(4, dec!(5))).await;
    ctl.handle_event(round_end(loss(4))).await;

    assert_eq!(ctl.state(), SessionState::PausedByRisk);
    assert_eq!(ctl.ledger().len(), 3);
    assert_eq!(ctl.ledger().aggregates().net_pnl_sol, dec!(-0.03));
    assert_eq!(ctl.ledger().aggregates().loss_streak, 3);
    assert_eq!(deployed_rounds(&ctl), vec![1, 2, 3]);
    assert!(matches!(ctl.notes().back().unwrap().outcome, RoundOutcome::Paused));
}

#[tokio::test]
async fn test_stream_gap_is_backfilled_without_deploying() {
    let api = Arc::new(ScriptedApi::new());
    api.push_round(RoundSnapshot::new(200, dec!(5)));
    api.push_round(RoundSnapshot::new(205, dec!(5)));
    api.push_stream(vec![RawEvent::new(
        "round_end",
        r#"{"round_number":200,"won":false,"sol_deployed":0.01,"sol_earned":0}"#,
    )]);
    api.push_results((201..=204).map(loss));

    let mut ctl = controller(&api);
    ctl.start(SessionConfig::new(dec!(0.01), 25)).await.unwrap();

    let (mut events, task, shutdown_tx) = spawn_ingestor(&api);

    let drive = async {
        while let Some(event) = events.recv().await {
            let done = matches!(&event, MiningEvent::RoundStart(s) if s.round_number == 205);
            ctl.handle_event(event).await;
            if done {
                break;
            }
        }
    };
    timeout(Duration::from_secs(5), drive)
        .await
        .expect("ingestor never released round 205");
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    let entries = ctl.ledger().entries();
    let rounds: Vec<u64> = entries.iter().map(|e| e.result.round_number).collect();
    assert_eq!(rounds, vec![200, 201, 202, 203, 204]);
    assert!(!entries[0].reconstructed);
    assert!(entries[1..].iter().all(|e| e.reconstructed));
    assert!(ctl.ledger().is_consistent());

    assert_eq!(deployed_rounds(&ctl), vec![200, 205]);
    assert!(ctl
        .notes()
        .iter()
        .any(|n| n.round == 201 && n.outcome == RoundOutcome::Gap { to_round: 204 }));
    assert!(api.calls().contains(&Call::SessionRounds(Some(201))));
    assert_eq!(api.writes().len(), 1);
}

#[tokio::test]
async fn test_auth_expiry_faults_until_reauthenticated() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    let mut cfg = SessionConfig::new(dec!(0.01), 5);
    cfg.tile_selection = TileSelection::Random;
    cfg.auto_restart = false;
    ctl.start(cfg.clone()).await.unwrap();

    ctl.handle_event(round_start(100, dec!(5))).await;
    assert_eq!(ctl.state(), SessionState::Active);

    api.fail_with(|endpoint| ApiError::AuthExpired { endpoint });
    ctl.handle_event(round_start(101, dec!(5))).await;

    assert_eq!(ctl.state(), SessionState::Faulted);
    assert_eq!(ctl.fault().map(|f| f.kind), Some(ErrorKind::AuthExpired));
    let status = ctl.status_handle();
    {
        let snapshot = status.read().await;
        assert_eq!(snapshot.state, SessionState::Faulted);
        assert_eq!(snapshot.fault.as_ref().map(|f| f.kind), Some(ErrorKind::AuthExpired));
    }

    // No further writes while faulted.
    let writes = api.writes().len();
    ctl.handle_event(round_start(102, dec!(5))).await;
    let err = assert_err!(ctl.start(cfg).await);
    assert!(matches!(err, ControllerError::Faulted { kind: ErrorKind::AuthExpired, .. }));
    assert_eq!(api.writes().len(), writes);

    ctl.reauthenticate(Arc::new(ScriptedApi::new())).await.unwrap();
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(ctl.fault().is_none());
}

#[tokio::test]
async fn test_explicit_tiles_honored() {
    let tiles = vec![0u8, 6, 12, 18, 24];
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    let mut cfg = SessionConfig::new(dec!(0.005), 5);
    cfg.tile_selection = TileSelection::Explicit(tiles.clone());

    let snapshot = RoundSnapshot::new(300, dec!(5));
    let decision = strategy::decide(&snapshot, &cfg, &Ledger::new(10), &EvalContext::default());
    match decision {
        Decision::Deploy(plan) => {
            assert_eq!(plan.tiles, TileChoice::Tiles(tiles.clone()));
            assert_eq!(plan.sol_amount, dec!(0.005));
        }
        other => panic!("expected deploy, got {other:?}"),
    }

    ctl.start(cfg).await.unwrap();
    assert_eq!(api.writes(), vec![Call::StartExplicit(tiles.clone())]);

    ctl.handle_event(MiningEvent::RoundStart(snapshot)).await;
    // The backend already deploys on the pinned tiles.
    assert_eq!(api.writes().len(), 1);
    assert_eq!(
        ctl.notes().back().map(|n| n.outcome.clone()),
        Some(RoundOutcome::Deployed {
            tiles: TileChoice::Tiles(tiles),
            sol: dec!(0.005),
            reloaded: false,
        })
    );
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    ctl.start(SessionConfig::new(dec!(0.01), 25)).await.unwrap();

    assert!(assert_ok!(ctl.stop().await).is_some());
    assert_eq!(ctl.state(), SessionState::Stopped);

    assert!(assert_ok!(ctl.stop().await).is_none());
    assert_eq!(ctl.state(), SessionState::Stopped);
    assert_eq!(api.writes().iter().filter(|c| **c == Call::Stop).count(), 1);
}

#[tokio::test]
async fn test_conflicting_backend_session_refused() {
    let api = Arc::new(ScriptedApi::new());
    let other = api.start(&SessionConfig::new(dec!(0.5), 25)).await.unwrap();

    let mut ctl = controller(&api);
    let err = assert_err!(ctl.start(SessionConfig::new(dec!(0.01), 25)).await);
    assert!(
        matches!(
            err,
            ControllerError::SessionConflict { ref session_id } if *session_id == other.session_id
        )
    );
    assert_eq!(ctl.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_ledger_rejection_recorded_in_status() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    ctl.start(SessionConfig::new(dec!(0.01), 25)).await.unwrap();

    ctl.handle_event(round_start(100, dec!(5))).await;
    ctl.handle_event(round_end(loss(100))).await;
    ctl.handle_event(round_end(loss(100))).await;
    ctl.handle_event(round_end(loss(99))).await;

    assert_eq!(ctl.ledger().len(), 1);
    assert!(ctl.ledger().is_consistent());
    let rejected: Vec<u64> = ctl
        .notes()
        .iter()
        .filter(|n| matches!(n.outcome, RoundOutcome::Rejected { .. }))
        .map(|n| n.round)
        .collect();
    assert_eq!(rejected, vec![100, 99]);

    let status = ctl.status_handle();
    let snapshot = status.read().await;
    assert!(matches!(
        snapshot.notes.last().map(|n| &n.outcome),
        Some(RoundOutcome::Rejected { .. })
    ));
    assert_eq!(snapshot.aggregates.rounds, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dead_stream_reconnects_with_backoff_then_polls() {
    let api = Arc::new(ScriptedApi::new());
    api.push_round(RoundSnapshot::new(100, dec!(5)));
    // Every connection closes at once without a frame.
    for _ in 0..40 {
        api.push_stream(Vec::new());
    }

    let (mut events, task, shutdown_tx) = spawn_ingestor(&api);
    sleep(Duration::from_secs(5)).await;

    let calls = api.calls();
    let connects = calls.iter().filter(|c| **c == Call::Events).count();
    assert_eq!(
        connects as u32,
        IngestConfig::default().sse_failures_before_poll
    );
    // Polling has taken over the live round.
    let polls = calls.iter().filter(|c| **c == Call::CurrentRound).count();
    assert!(polls > connects, "expected polling, got {calls:?}");

    assert!(matches!(
        events.recv().await,
        Some(MiningEvent::RoundStart(s)) if s.round_number == 100
    ));

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), task)
        .await
        .expect("ingestor ignored shutdown")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreturned_round_settles_when_result_appears() {
    let api = Arc::new(ScriptedApi::new());
    api.push_round(RoundSnapshot::new(200, dec!(5)));
    api.push_round(RoundSnapshot::new(206, dec!(5)));
    api.push_stream(vec![
        RawEvent::new(
            "deployment",
            r#"{"round":200,"tile_ids":[1,2],"sol_amount":0.01}"#,
        ),
        RawEvent::new("round_start", r#"{"round_number":205,"ev_estimate_pct":5}"#),
    ]);
    // The backend is slow to settle round 200.
    api.push_results((201..=204).map(loss));

    let mut ctl = controller(&api);
    ctl.start(SessionConfig::new(dec!(0.01), 25)).await.unwrap();
    let (mut events, task, shutdown_tx) = spawn_ingestor(&api);

    let drive = async {
        while let Some(event) = events.recv().await {
            let done = matches!(&event, MiningEvent::RoundStart(s) if s.round_number == 205);
            ctl.handle_event(event).await;
            if done {
                break;
            }
        }
    };
    timeout(Duration::from_secs(5), drive)
        .await
        .expect("ingestor never released round 205");

    let rounds: Vec<u64> = ctl.ledger().entries().iter().map(|e| e.result.round_number).collect();
    assert_eq!(rounds, vec![201, 202, 203, 204]);
    assert!(ctl
        .notes()
        .iter()
        .any(|n| n.round == 200 && n.outcome == RoundOutcome::Unsettled { sol: dec!(0.01) }));

    api.push_results([result(200, true, dec!(0.01), dec!(0.019))]);
    let drive = async {
        while let Some(event) = events.recv().await {
            let done = matches!(
                &event,
                MiningEvent::RoundEnd { result, .. } if result.round_number == 200
            );
            ctl.handle_event(event).await;
            if done {
                break;
            }
        }
    };
    timeout(Duration::from_secs(30), drive)
        .await
        .expect("late result for round 200 never arrived");
    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), task)
        .await
        .expect("ingestor ignored shutdown")
        .unwrap();

    let ledger = ctl.ledger();
    let rounds: Vec<u64> = ledger.entries().iter().map(|e| e.result.round_number).collect();
    assert_eq!(rounds, vec![200, 201, 202, 203, 204]);
    assert!(ledger.is_consistent());
    assert_eq!(ledger.aggregates().win_count, 1);
    assert_eq!(ledger.aggregates().net_pnl_sol, dec!(-0.031));
    assert!(ledger.entries()[0].reconstructed);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_bounded_when_stop_hangs() {
    let api = Arc::new(ScriptedApi::new());
    let mut ctl = controller(&api);
    ctl.start(SessionConfig::new(dec!(0.01), 25)).await.unwrap();
    ctl.handle_event(round_start(5, dec!(5))).await;
    api.stall(Endpoint::Stop);

    let (_tx, mut rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = watch::channel(false);
    stop_tx.send(true).unwrap();

    let began = Instant::now();
    let outcome = ctl.run(&mut rx, stop_rx).await;
    let elapsed = began.elapsed();

    let grace = Duration::from_secs(ControllerConfig::default().shutdown_grace_secs);
    assert!(elapsed >= grace, "returned before the grace period: {elapsed:?}");
    assert!(elapsed <= grace + Duration::from_millis(100), "took {elapsed:?}");
    assert_eq!(outcome, RunOutcome::Shutdown);
    assert_eq!(ctl.state(), SessionState::Stopped);
    assert!(api.calls().contains(&Call::Stop));
}

#[tokio::test(start_paused = true)]
async fn test_ingestor_exits_while_round_fetch_hangs() {
    let api = Arc::new(ScriptedApi::new());
    api.stall(Endpoint::CurrentRound);

    let (_events, task, shutdown_tx) = spawn_ingestor(&api);
    sleep(Duration::from_millis(50)).await;
    assert!(api.calls().contains(&Call::CurrentRound));

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(1), task)
        .await
        .expect("ingestor stuck in a hung request")
        .unwrap();
}
