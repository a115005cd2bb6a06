mod utils;
#[allow(unused)]
use utils::*;

#[cfg(unix)]
mod tests {
    use super::*;

    use mock_service::InMemoryQuiz;
    use stagger_core::Mode;
    use stagger_runtime::{ProcessError, RuntimeError, StaggerRuntime, TargetCommand};

    #[tokio::test]
    #[ntest::timeout(30_000)]
    async fn failed_server_start_cleans_up() {
        init();
        // Scratch databases land in TMPDIR; this binary holds only this test.
        let scratch = tempfile::tempdir().unwrap();
        std::env::set_var("TMPDIR", scratch.path());
        let results = tempfile::tempdir().unwrap();

        // The server leaves database files behind and exits before announcing readiness.
        let server = TargetCommand::new("sh")
            .arg("-c")
            .arg(r#"touch "$DB_PATH" "$DB_PATH-wal" "$DB_PATH-shm"; exit 3"#);
        let err = StaggerRuntime::new(InMemoryQuiz::open)
            .mode(Mode::Ws)
            .results_dir(results.path())
            .server_command(server)
            .run()
            .await
            .err()
            .unwrap();

        match err {
            RuntimeError::Process(ProcessError::Exited(status)) => {
                assert_eq!(status.code(), Some(3))
            }
            other => panic!("unexpected error: {other}"),
        }

        let leftovers: Vec<_> = std::fs::read_dir(scratch.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("quiz-stress-ws-"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
        assert_eq!(std::fs::read_dir(results.path()).unwrap().count(), 0);
    }
}
