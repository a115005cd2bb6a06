mod utils;
#[allow(unused)]
use utils::*;

use mock_service::ServerOptions;
use stagger::prelude::*;
use stagger::RunError;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
#[ntest::timeout(30_000)]
async fn stages_against_quiz_server() {
    init();
    let url = quiz_server(ServerOptions::default()).await;
    let config = quick_config(Mode::Ws, &[20, 40], 500);
    let connection = ConnectionConfig {
        max_clients: 16,
        ..ConnectionConfig::default()
    };
    let driver = ConnectionDriver::new(url, &config, connection);

    let output = run_benchmark(&driver, &config).await.unwrap();

    assert_eq!(output.mode, Mode::Ws);
    assert_eq!(output.stages.len(), 2);
    assert_eq!(output.stages[0].target_rps, 20);
    assert_eq!(output.stages[1].target_rps, 40);
    for (idx, stage) in output.stages.iter().enumerate() {
        assert_eq!(stage.stage, idx + 1);
        assert_eq!(stage.mode, "ws");
        assert!(stage.ok > 0, "stage {} had no successes", stage.stage);
        assert!(stage.notes["activeClients"] <= 16);
        // Answers with no connection to answer on fall back to a join and count as both.
        assert!(stage.notes["joinOps"] + stage.notes["answerOps"] >= stage.total);
    }
    assert_eq!(driver.active_clients(), 0);
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn pool_never_exceeds_client_cap() {
    init();
    let url = quiz_server(ServerOptions::default()).await;
    let mut config = quick_config(Mode::Ws, &[60], 400);
    config.warmup_population = 0;
    let connection = ConnectionConfig {
        max_clients: 2,
        ..ConnectionConfig::default()
    };
    let driver = ConnectionDriver::new(url, &config, connection);

    let output = run_benchmark(&driver, &config).await.unwrap();
    let notes = &output.stages[0].notes;

    assert!(notes["activeClients"] <= 2);
    assert!(notes["createJoinOps"] <= 2);
    assert!(notes["createJoinOps"] + notes["reuseJoinOps"] <= notes["joinOps"]);
}

#[tokio::test]
#[ntest::timeout(10_000)]
async fn unreachable_server_fails_warmup() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = quick_config(Mode::Ws, &[10], 200);
    let connection = ConnectionConfig {
        response_timeout: Duration::from_secs(2),
        ..ConnectionConfig::default()
    };
    let driver = ConnectionDriver::new(format!("ws://{addr}"), &config, connection);

    let err = run_benchmark(&driver, &config).await.err().unwrap();
    assert!(matches!(err, RunError::Warmup { joined: 0, .. }));
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn rate_limited_server_fails_stage() {
    init();
    let options = ServerOptions {
        max_rps: std::num::NonZeroU32::new(5),
        leaderboard_size: 0,
        ..ServerOptions::default()
    };
    let url = quiz_server(options).await;
    let mut config = quick_config(Mode::Ws, &[100], 500);
    config.warmup_population = 0;
    let driver = ConnectionDriver::new(url, &config, ConnectionConfig::default());

    let output = run_benchmark(&driver, &config).await.unwrap();
    let stage = &output.stages[0];

    assert!(stage.errors > 0);
    assert!(stage.notes["protocolErrors"] > 0);
    assert!(!stage.pass);
    assert_eq!(output.max_sustainable_rps, 0);
}
