//! Cross-crate integration and E2E tests
//!
//! Full completion flows through the driver, handler, and both
//! environments, driven by a scripted mock backend. Flows that execute
//! code need a `python3` interpreter and return early when it is absent.

use std::sync::Arc;

use ouro_rlm::{
    Environment, LocalConfig, LocalEnv, MockBackend, PythonSession, RemoteConfig, RemoteEnv, Rlm,
    RlmConfig, StopReason,
};

fn config() -> RlmConfig {
    RlmConfig::new().with_max_iterations(5).with_max_depth(1)
}

async fn python_available() -> bool {
    PythonSession::is_available("python3").await
}

/// Scenario 1: the model answers immediately, no code involved.
#[tokio::test]
async fn test_echo_final_answer() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::with_text("FINAL_ANSWER: hi"));
    let rlm = Rlm::with_backend(backend, config()).unwrap();

    let completion = rlm.completion("Say hi").await.unwrap();

    assert_eq!(completion.response, "hi");
    assert_eq!(completion.iterations.len(), 1);
    assert!(completion.iterations[0].code_blocks.is_empty());
    assert!(!completion.metadata.truncated);
}

/// Scenario 2: one code block, then the answer.
#[tokio::test]
async fn test_one_code_block() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec![
        "```\nprint(2+2)\n```",
        "FINAL_ANSWER: 4",
    ]));
    let rlm = Rlm::with_backend(backend, config()).unwrap();

    let completion = rlm.completion("What is 2+2?").await.unwrap();

    assert_eq!(completion.response, "4");
    assert_eq!(completion.iterations.len(), 2);
    assert_eq!(completion.iterations[0].code_blocks[0].result.stdout, "4\n");
}

/// Scenario 3: recursion through `llm_query`, usage from both models.
#[tokio::test]
async fn test_recursive_llm_query() {
    if !python_available().await {
        return;
    }
    let outer = Arc::new(MockBackend::with_model(
        "mock-outer",
        vec![
            "```\nprint(llm_query('spell DOG'))\n```",
            "FINAL_ANSWER: D-O-G",
        ],
    ));
    let nested = Arc::new(MockBackend::with_model("mock-nested", vec!["D-O-G"]));
    let rlm = Rlm::with_backend(outer, config())
        .unwrap()
        .with_subcall_backend(nested);

    let completion = rlm.completion("Spell DOG").await.unwrap();

    assert_eq!(completion.response, "D-O-G");
    let calls = &completion.iterations[0].code_blocks[0].result.rlm_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].response, "D-O-G");
    assert!(completion.usage.get("mock-outer").is_some());
    assert!(completion.usage.get("mock-nested").is_some());
}

/// Scenario 4: max_depth = 0 takes the fallback path.
#[tokio::test]
async fn test_depth_zero_fallback() {
    let backend = Arc::new(MockBackend::with_text("plain response"));
    let rlm = Rlm::with_backend(backend, config().with_max_depth(0)).unwrap();

    let completion = rlm.completion("anything").await.unwrap();

    assert!(completion.iterations.is_empty());
    assert_eq!(completion.response, "plain response");
    assert!(completion.metadata.fallback);
    assert_eq!(completion.metadata.stop, StopReason::Fallback);
}

/// Scenario 5: the iteration budget truncates the completion.
#[tokio::test]
async fn test_iteration_budget() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec!["thinking...", "still thinking..."]));
    let rlm = Rlm::with_backend(backend, config().with_max_iterations(2)).unwrap();

    let completion = rlm.completion("never answers").await.unwrap();

    assert_eq!(completion.iterations.len(), 2);
    assert!(completion.metadata.truncated);
    assert_eq!(completion.response, "still thinking...");
}

/// Scenario 6: an exception in executed code never escapes the driver.
#[tokio::test]
async fn test_execution_error_continues() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec![
        "```\n1/0\n```",
        "FINAL_ANSWER: survived",
    ]));
    let rlm = Rlm::with_backend(backend, config()).unwrap();

    let completion = rlm.completion("divide by zero").await.unwrap();

    assert!(
        completion.iterations[0].code_blocks[0]
            .result
            .stderr
            .contains("ZeroDivisionError")
    );
    assert_eq!(completion.response, "survived");
}

/// The same flow through the sandbox environment: code runs behind the
/// HTTP broker and `llm_query` travels enqueue -> poller -> handler.
#[tokio::test]
async fn test_sandbox_environment_flow() {
    if !python_available().await {
        return;
    }
    let outer = Arc::new(MockBackend::with_model(
        "mock-outer",
        vec![
            "```\nprint(llm_query('spell CAT'))\n```",
            "FINAL_ANSWER: C-A-T",
        ],
    ));
    let nested = Arc::new(MockBackend::with_model("mock-nested", vec!["C-A-T"]));
    let rlm_config = config()
        .with_environment("sandbox")
        .with_environment_kwargs(serde_json::json!({"poll_interval_ms": 20}));
    let rlm = Rlm::with_backend(outer, rlm_config)
        .unwrap()
        .with_subcall_backend(nested);

    let completion = rlm.completion("Spell CAT").await.unwrap();

    assert_eq!(completion.response, "C-A-T");
    let block = &completion.iterations[0].code_blocks[0];
    assert_eq!(block.result.stdout, "C-A-T\n", "stderr: {}", block.result.stderr);
    assert_eq!(block.result.rlm_calls.len(), 1);
    assert!(completion.usage.get("mock-nested").is_some());
}

/// Persistence: slots and namespace survive across fresh drivers (P6).
#[tokio::test]
async fn test_multi_turn_persistence() {
    if !python_available().await {
        return;
    }
    let mut env = LocalEnv::new(LocalConfig::default(), "127.0.0.1:1".parse().unwrap());
    env.setup().await.unwrap();
    let idx = env.load_context("the quick brown fox", None).await.unwrap();
    assert_eq!(idx, 0);
    assert_eq!(env.context_count().await.unwrap(), 1);

    let first = Arc::new(MockBackend::new(vec![
        "```\nwords = len(context.split())\n```",
        "FINAL_ANSWER: counted",
    ]));
    let rlm = Rlm::with_backend(first, config()).unwrap();
    rlm.completion_in("count words", &mut env).await.unwrap();

    let second = Arc::new(MockBackend::new(vec![
        "```\nprint(words)\n```",
        "FINAL_ANSWER: 4",
    ]));
    let rlm = Rlm::with_backend(second, config()).unwrap();
    let completion = rlm.completion_in("recall", &mut env).await.unwrap();

    assert_eq!(completion.iterations[0].code_blocks[0].result.stdout, "4\n");
    assert_eq!(completion.response, "4");
    assert_eq!(env.context_count().await.unwrap(), 1);

    env.teardown().await.unwrap();
}

/// The trajectory file carries one self-contained record per event.
#[tokio::test]
async fn test_trajectory_sink_end_to_end() {
    if !python_available().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trajectory.jsonl");
    let sink = Arc::new(ouro_tracing::FileSink::new(&path).unwrap());

    let backend = Arc::new(MockBackend::new(vec![
        "```\nprint('step')\n```",
        "FINAL_ANSWER: logged",
    ]));
    let rlm = Rlm::with_backend(backend, config())
        .unwrap()
        .with_sink(sink);
    rlm.completion("log this").await.unwrap();

    let records = ouro_tracing::TrajectoryWriter::read_records(&path).unwrap();
    let events: Vec<&str> = records.iter().map(|r| r.event_name()).collect();
    assert_eq!(events, vec!["metadata", "iteration", "iteration", "done"]);

    // Records round-trip line by line.
    for record in &records {
        let line = record.to_record();
        assert_eq!(
            &ouro_tracing::TrajectoryRecord::from_record(&line).unwrap(),
            record
        );
    }
}

/// Direct remote-environment use outside a driver.
#[tokio::test]
async fn test_remote_env_standalone() {
    if !python_available().await {
        return;
    }
    let mut env = RemoteEnv::new(RemoteConfig::default(), "127.0.0.1:1".parse().unwrap());
    env.setup().await.unwrap();

    let result = env.execute_code("print(sum(range(10)))").await.unwrap();
    assert_eq!(result.stdout, "45\n");

    env.teardown().await.unwrap();
}
