//! Session lifecycle against real stand-in processes: single active
//! pipeline, idempotent stop, presence-driven teardown.

use crate::helpers::{
    BOUND, commands, is_alive, pid_recording_fetcher, recorded_pids, stand_in_config,
    start_supervisor,
};
use liverelay::gate::{ConsumerPresence, GateOutcome, PresenceEvent};
use liverelay::supervisor::{RebuildOutcome, StopOutcome};
use liverelay::RelaySession;

const URL: &str = "http://radio.test/live";

fn joined() -> PresenceEvent {
    PresenceEvent::ConsumerJoined {
        presence: ConsumerPresence { consumers: 1 },
    }
}

#[tokio::test]
async fn at_most_one_pipeline_is_ever_alive() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pids");
    let (handle, sink) = start_supervisor(commands(pid_recording_fetcher(&pid_file)));

    let mut started = 0;
    for step in 0..6 {
        if step % 3 == 2 {
            handle.stop().await.unwrap();
            let pids = recorded_pids(&pid_file, started).await;
            assert!(pids.iter().all(|pid| !is_alive(*pid)), "stop left a fetcher running");
            continue;
        }

        let outcome = tokio::time::timeout(BOUND, handle.rebuild(URL))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, RebuildOutcome::Started { .. }));
        started += 1;

        let pids = recorded_pids(&pid_file, started).await;
        let (current, previous) = pids.split_last().unwrap();
        assert!(is_alive(*current));
        for pid in previous {
            assert!(!is_alive(*pid), "fetcher {pid} outlived its pipeline");
        }
    }

    assert_eq!(sink.generations.lock().unwrap().len(), started);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn double_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pids");
    let (handle, _sink) = start_supervisor(commands(pid_recording_fetcher(&pid_file)));

    handle.rebuild(URL).await.unwrap();
    let pids = recorded_pids(&pid_file, 1).await;

    assert_eq!(handle.stop().await.unwrap(), StopOutcome::Stopped);
    let after_first = handle.snapshot();
    assert_eq!(handle.stop().await.unwrap(), StopOutcome::NothingActive);

    assert_eq!(handle.snapshot(), after_first);
    assert!(!after_first.live);
    assert!(!is_alive(pids[0]));
}

#[tokio::test]
async fn empty_consumer_set_stops_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pids");
    let config = stand_in_config(pid_recording_fetcher(&pid_file));
    let session = RelaySession::start(&config).unwrap();

    let outcome = session.gate().handle(joined()).await.unwrap();
    assert!(matches!(outcome, GateOutcome::Rebuilt(RebuildOutcome::Started { .. })));
    let pids = recorded_pids(&pid_file, 1).await;
    assert!(is_alive(pids[0]));

    assert_eq!(
        session.gate().handle(PresenceEvent::ConsumersEmpty).await.unwrap(),
        GateOutcome::Stopped(StopOutcome::Stopped)
    );
    assert!(!is_alive(pids[0]));
    let status = session.supervisor().status().await.unwrap();
    assert!(status.pipeline.is_none());
    assert!(!status.snapshot.live);

    // Duplicate empty notification: nothing left to stop.
    assert_eq!(
        session.gate().handle(PresenceEvent::ConsumersEmpty).await.unwrap(),
        GateOutcome::Stopped(StopOutcome::NothingActive)
    );

    assert_eq!(session.shutdown().await.unwrap(), StopOutcome::NothingActive);
}

#[tokio::test]
async fn stop_command_reply_reflects_session() {
    let config = stand_in_config(crate::helpers::sh("sleep 30"));
    let session = RelaySession::start(&config).unwrap();

    let GateOutcome::Replied(idle) = session
        .gate()
        .handle(PresenceEvent::StopRequested)
        .await
        .unwrap()
    else {
        panic!("stop request must be answered");
    };
    assert!(!idle.torn_down);

    session.gate().handle(joined()).await.unwrap();
    let GateOutcome::Replied(active) = session
        .gate()
        .handle(PresenceEvent::StopRequested)
        .await
        .unwrap()
    else {
        panic!("stop request must be answered");
    };
    assert!(active.torn_down);
    assert_ne!(idle.text, active.text);

    session.shutdown().await.unwrap();
}
