mod utils;
#[allow(unused)]
use utils::*;

use mock_service::InMemoryQuiz;
use stagger::prelude::*;

#[tracing_test::traced_test]
#[tokio::test]
async fn in_process_stages_pass() {
    let config = quick_config(Mode::Service, &[100, 200], 300);
    let driver = ServiceDriver::new(InMemoryQuiz::new(5), &config);

    let output = run_benchmark(&driver, &config).await.unwrap();

    assert_eq!(output.mode, Mode::Service);
    assert_eq!(output.stages.len(), 2);
    assert!(output.stages.iter().all(|stage| stage.pass && stage.errors == 0));
    assert_eq!(output.max_sustainable_rps, 200);

    let quiz = driver.service();
    assert!(quiz.participants("integration").unwrap() >= config.warmup_population);
    assert_eq!(quiz.participants("integration").unwrap(), driver.population());
    assert!(output.stages[1].notes["users"] >= output.stages[0].notes["users"]);
    assert!(logs_contain("maxSustainableRps=200"));
}

#[tokio::test]
async fn report_echoes_configuration() {
    let config = quick_config(Mode::Service, &[50], 200);
    let driver = ServiceDriver::new(InMemoryQuiz::new(3), &config);

    let output = run_benchmark(&driver, &config).await.unwrap();
    let report = serde_json::to_value(&output).unwrap();

    assert_eq!(report["mode"], "service");
    assert_eq!(report["config"]["stageRps"], serde_json::json!([50]));
    assert_eq!(report["config"]["stageDurationMs"], 200);
    assert_eq!(report["config"]["sessionId"], "integration");
    assert_eq!(report["stages"][0]["targetRps"], 50);
    assert!(report["stages"][0]["latencyMs"]["p95"].is_number());
    assert!(report["resources"]["rssMbPeak"].as_f64().unwrap() > 0.);
}
