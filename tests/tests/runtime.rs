mod utils;
#[allow(unused)]
use utils::*;

use mock_service::InMemoryQuiz;
use stagger_core::Mode;
use stagger_runtime::StaggerRuntime;

#[tokio::test]
#[ntest::timeout(30_000)]
async fn service_run_writes_report() {
    init();
    // Only test in this binary, so the environment is not shared.
    std::env::set_var("STRESS_STAGE_RPS", "40,80");
    std::env::set_var("STRESS_STAGE_DURATION_MS", "200");
    std::env::set_var("STRESS_WARMUP_MS", "0");
    std::env::set_var("STRESS_WARMUP_USERS", "0");

    let results = tempfile::tempdir().unwrap();
    let paths = StaggerRuntime::new(InMemoryQuiz::open)
        .mode(Mode::Service)
        .results_dir(results.path())
        .run()
        .await
        .unwrap();

    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with(results.path()));
    assert!(paths[0].to_string_lossy().ends_with("-service.json"));

    let body = std::fs::read_to_string(&paths[0]).unwrap();
    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["mode"], "service");
    assert_eq!(report["stages"].as_array().unwrap().len(), 2);
    assert_eq!(report["config"]["stageRps"], serde_json::json!([40, 80]));

    // The scratch database path is reported but removed after the run.
    let db_path = report["config"]["dbPath"].as_str().unwrap();
    assert!(db_path.contains("quiz-stress-service-"));
    assert!(!std::path::Path::new(db_path).exists());
}
