//! End-to-end dispatch over real TCP workers on loopback.

mod common;

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use common::{local_session, tiller_batch, tiller_batch_with_delay, yield_command};
use sim_relay::bootstrap::{RelaySession, StaticBootstrapper};
use sim_relay::execution::{Command, DispatchError, JobManagerConfig, TransportError, WorkerFailure};
use sim_relay::testing::{spawn_local_workers, ScriptedEngine, TILLER_INTERCEPT};

#[tokio::test]
async fn test_three_workers_report_in_index_order() {
    let session = local_session(3, ScriptedEngine::new(), 10_000).await;
    let command = yield_command(tiller_batch(&["0.1", "0.2", "0.3"]));

    let result = session.dispatch(&command).await.unwrap();

    assert_eq!(result.command_id(), command.command_id());
    assert_eq!(result.columns(), ["Yield"]);
    assert_eq!(result.len(), 3);
    for (i, value) in ["0.1", "0.2", "0.3"].iter().enumerate() {
        let worker = result.get(i).unwrap();
        assert_eq!(worker.worker_index(), i);
        assert_eq!(worker.rows().len(), 1);
        assert_eq!(
            worker.first_row().unwrap().get(0),
            Some(ScriptedEngine::expected_yield(value).as_str())
        );
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_worker_does_not_reorder_results() {
    let session = local_session(3, ScriptedEngine::new(), 10_000).await;
    let command = yield_command(tiller_batch_with_delay(&["0.1", "0.2", "0.3"], 0, 200));

    let result = session.dispatch(&command).await.unwrap();

    let yields: Vec<String> = result.rows().map(|row| row.to_string()).collect();
    assert_eq!(
        yields,
        vec![
            ScriptedEngine::expected_yield("0.1"),
            ScriptedEngine::expected_yield("0.2"),
            ScriptedEngine::expected_yield("0.3"),
        ]
    );
    // fan-out is concurrent, so one slow worker bounds the wall time
    assert!(result.elapsed() >= Duration::from_millis(200));
    assert!(result.elapsed() < Duration::from_secs(5));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_columns_follow_requested_order() {
    let session = local_session(2, ScriptedEngine::new(), 10_000).await;
    let command = Command::new(tiller_batch(&["0.4", "0.5"]), "Report", ["Yield", "Date"]).unwrap();

    let result = session.dispatch(&command).await.unwrap();

    let row = result.get(1).unwrap().first_row().unwrap();
    assert_eq!(row.get(0), Some(ScriptedEngine::expected_yield("0.5").as_str()));
    assert_eq!(row.get(1), Some("1990-01-01"));
    assert_eq!(row.join(","), format!("{},1990-01-01", ScriptedEngine::expected_yield("0.5")));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_multi_row_reports_keep_row_order() {
    let session = local_session(2, ScriptedEngine::new().with_rows(3), 10_000).await;
    let command = Command::new(tiller_batch(&["1", "2"]), "Report", ["Date"]).unwrap();

    let result = session.dispatch(&command).await.unwrap();

    let dates: Vec<String> = result.rows().map(|row| row.to_string()).collect();
    assert_eq!(
        dates,
        vec![
            "1990-01-01",
            "1990-01-02",
            "1990-01-03",
            "1990-01-01",
            "1990-01-02",
            "1990-01-03"
        ]
    );

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_size_mismatch_is_rejected() {
    let session = local_session(2, ScriptedEngine::new(), 10_000).await;
    let command = yield_command(tiller_batch(&["0.1", "0.2", "0.3"]));

    let err = session.dispatch(&command).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::SizeMismatch {
            batch_len: 3,
            worker_count: 2
        }
    );

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_timeout_fails_dispatch() {
    let session = local_session(3, ScriptedEngine::new(), 200).await;
    let command = yield_command(tiller_batch_with_delay(&["0.1", "0.2", "0.3"], 1, 5_000));

    let err = session.dispatch(&command).await.unwrap_err();

    assert_eq!(
        err,
        DispatchError::WorkerExecutionFailed {
            index: 1,
            cause: WorkerFailure::Timeout { timeout_ms: 200 }
        }
    );

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_simulation_error_identifies_worker() {
    let engine = ScriptedEngine::new().failing_when(TILLER_INTERCEPT, "0.3");
    let session = local_session(3, engine, 10_000).await;
    let command = yield_command(tiller_batch(&["0.1", "0.2", "0.3"]));

    let err = session.dispatch(&command).await.unwrap_err();

    assert_eq!(err.worker_index(), Some(2));
    assert!(matches!(
        err,
        DispatchError::WorkerExecutionFailed {
            cause: WorkerFailure::Simulation(_),
            ..
        }
    ));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_report_fails_every_worker() {
    let session = local_session(2, ScriptedEngine::new(), 10_000).await;
    let command = Command::new(tiller_batch(&["0.1", "0.2"]), "DailyReport", ["Yield"]).unwrap();

    let err = session.dispatch(&command).await.unwrap_err();
    match err {
        DispatchError::WorkerExecutionFailed {
            cause: WorkerFailure::Simulation(message),
            ..
        } => assert!(message.contains("DailyReport")),
        other => panic!("unexpected error: {other:?}"),
    }

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_column_is_reported_by_name() {
    let session = local_session(2, ScriptedEngine::new(), 10_000).await;
    let command = Command::new(tiller_batch(&["0.1", "0.2"]), "Report", ["Yield", "LAI"]).unwrap();

    let err = session.dispatch(&command).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::ColumnMissing { ref name, .. } if name == "LAI"
    ));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pool_is_reusable_across_dispatches() {
    let session = local_session(2, ScriptedEngine::new(), 10_000).await;

    let first = session
        .dispatch(&yield_command(tiller_batch(&["0.1", "0.2"])))
        .await
        .unwrap();
    let failed = session
        .dispatch(&yield_command(tiller_batch(&["0.1", "0.2", "0.3"])))
        .await;
    let second = session
        .dispatch(&yield_command(tiller_batch(&["0.7", "0.8"])))
        .await
        .unwrap();

    assert!(failed.is_err());
    assert_ne!(first.command_id(), second.command_id());
    assert_eq!(
        second.get(1).unwrap().first_row().unwrap().get(0),
        Some(ScriptedEngine::expected_yield("0.8").as_str())
    );
    assert_eq!(
        first.get(1).unwrap().first_row().unwrap().get(0),
        Some(ScriptedEngine::expected_yield("0.2").as_str())
    );

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancellation_leaves_pool_usable() {
    let session = local_session(2, ScriptedEngine::new(), 60_000).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let hung = yield_command(tiller_batch_with_delay(&["0.1", "0.2"], 0, 30_000));
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        session.dispatch_with_cancellation(&hung, &cancel),
    )
    .await
    .expect("cancellation did not stop the dispatch")
    .unwrap_err();

    assert_eq!(err, DispatchError::Cancelled);
    assert_eq!(session.registry().count(), 2);

    let result = session
        .dispatch(&yield_command(tiller_batch(&["0.1", "0.2"])))
        .await
        .unwrap();
    assert_eq!(result.len(), 2);

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_static_bootstrapper_with_unreachable_worker() {
    let servers = spawn_local_workers(1, ScriptedEngine::new()).await.unwrap();

    // bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead: SocketAddr = listener.local_addr().unwrap();
    drop(listener);

    let bootstrapper = StaticBootstrapper::new(vec![servers[0].local_addr(), dead])
        .with_job_manager_config(JobManagerConfig {
            worker_timeout_ms: 5_000,
        });
    let mut session = RelaySession::start(bootstrapper).await.unwrap();
    session.provision(2, None).await.unwrap();

    let err = session
        .dispatch(&yield_command(tiller_batch(&["0.1", "0.2"])))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::WorkerExecutionFailed {
            index: 1,
            cause: WorkerFailure::Transport(TransportError::Connect { .. })
        }
    ));

    session.shutdown().await.unwrap();
    for server in servers {
        server.stop().await;
    }
}
