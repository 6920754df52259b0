//! Driver tests: the end-to-end seed scenarios against a mock backend.
//!
//! Scenarios that execute code need a `python3` interpreter; those probe
//! availability first and return early when it is absent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::backend::{CompletionOutcome, LmBackend, MockBackend};
use crate::local::{LocalConfig, LocalEnv};
use crate::repl::PythonSession;

fn test_config() -> RlmConfig {
    RlmConfig::new().with_max_iterations(5).with_max_depth(1)
}

async fn python_available() -> bool {
    PythonSession::is_available("python3").await
}

#[test]
fn test_zero_iterations_is_a_config_error() {
    let backend = Arc::new(MockBackend::with_text("x"));
    let result = Rlm::with_backend(backend, RlmConfig::new().with_max_iterations(0));
    assert!(matches!(result, Err(RlmError::Config(_))));
}

#[tokio::test]
async fn test_echo_final_answer() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::with_text("FINAL_ANSWER: hi"));
    let rlm = Rlm::with_backend(backend, test_config()).unwrap();

    let completion = rlm.completion("Say hi").await.unwrap();

    assert_eq!(completion.response, "hi");
    assert_eq!(completion.iterations.len(), 1);
    assert!(completion.iterations[0].code_blocks.is_empty());
    assert!(!completion.metadata.truncated);
    assert!(!completion.metadata.fallback);
    assert_eq!(completion.metadata.stop, StopReason::FinalAnswer);
}

#[tokio::test]
async fn test_one_code_block_no_recursion() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec![
        "Let me compute.\n```\nprint(2+2)\n```",
        "FINAL_ANSWER: 4",
    ]));
    let rlm = Rlm::with_backend(backend, test_config()).unwrap();

    let completion = rlm.completion("What is 2+2?").await.unwrap();

    assert_eq!(completion.response, "4");
    assert_eq!(completion.iterations.len(), 2);
    let block = &completion.iterations[0].code_blocks[0];
    assert_eq!(block.result.stdout, "4\n");
    assert!(block.result.rlm_calls.is_empty());
    // Per-block time is bounded by the turn time.
    assert!(block.result.elapsed_secs <= completion.iterations[0].elapsed_secs);
}

#[tokio::test]
async fn test_recursive_call_via_llm_query() {
    if !python_available().await {
        return;
    }
    let outer = Arc::new(MockBackend::with_model(
        "mock-outer",
        vec![
            "```\nanswer = llm_query('spell DOG')\nprint(answer)\n```",
            "FINAL_ANSWER: D-O-G",
        ],
    ));
    let nested = Arc::new(MockBackend::with_model("mock-nested", vec!["D-O-G"]));

    let rlm = Rlm::with_backend(outer, test_config())
        .unwrap()
        .with_subcall_backend(nested);

    let completion = rlm.completion("Spell the word").await.unwrap();

    assert_eq!(completion.response, "D-O-G");
    let block = &completion.iterations[0].code_blocks[0];
    assert_eq!(block.result.stdout, "D-O-G\n", "stderr: {}", block.result.stderr);
    assert_eq!(block.result.rlm_calls.len(), 1);
    assert_eq!(block.result.rlm_calls[0].response, "D-O-G");
    assert_eq!(block.result.rlm_calls[0].model, "mock-nested");

    // Both model ids appear in the aggregate, each call counted once.
    assert_eq!(completion.usage.get("mock-outer").unwrap().calls, 2);
    assert_eq!(completion.usage.get("mock-nested").unwrap().calls, 1);
}

#[tokio::test]
async fn test_depth_limit_takes_fallback_path() {
    let backend = Arc::new(MockBackend::with_text("a plain answer"));
    let rlm = Rlm::with_backend(backend.clone(), test_config().with_max_depth(0)).unwrap();

    let completion = rlm.completion("anything").await.unwrap();

    assert!(completion.iterations.is_empty());
    assert_eq!(completion.response, "a plain answer");
    assert!(completion.metadata.fallback);
    assert!(!completion.metadata.truncated);
    assert_eq!(completion.metadata.stop, StopReason::Fallback);
    // Exactly one plain call was made.
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn test_iteration_budget_truncates() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec![
        "Still thinking...",
        "Almost there, I promise.",
        "This response is never requested",
    ]));
    let rlm =
        Rlm::with_backend(backend.clone(), test_config().with_max_iterations(2)).unwrap();

    let completion = rlm.completion("never ends").await.unwrap();

    assert_eq!(completion.iterations.len(), 2);
    assert!(completion.metadata.truncated);
    assert_eq!(completion.metadata.stop, StopReason::MaxIterations);
    // Synthesized from the last assistant turn.
    assert_eq!(completion.response, "Almost there, I promise.");
    assert_eq!(backend.request_count(), 2);
}

#[tokio::test]
async fn test_execution_error_does_not_stop_the_loop() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec![
        "```\nraise ValueError('broken')\n```",
        "FINAL_ANSWER: recovered",
    ]));
    let rlm = Rlm::with_backend(backend, test_config()).unwrap();

    let completion = rlm.completion("try it").await.unwrap();

    let block = &completion.iterations[0].code_blocks[0];
    assert!(block.result.stderr.contains("ValueError"));
    assert_eq!(completion.iterations.len(), 2);
    assert_eq!(completion.response, "recovered");
}

#[tokio::test]
async fn test_answer_before_code_skips_execution() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::with_text(
        "FINAL_ANSWER: done\n```\nprint('must not run')\n```",
    ));
    let rlm = Rlm::with_backend(backend, test_config()).unwrap();

    let completion = rlm.completion("go").await.unwrap();

    assert_eq!(completion.response, "done");
    assert!(completion.iterations[0].code_blocks.is_empty());
}

#[tokio::test]
async fn test_answer_after_code_runs_preceding_blocks() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::with_text(
        "```\nprint('ran')\n```\nFINAL_ANSWER: both happened",
    ));
    let rlm = Rlm::with_backend(backend, test_config()).unwrap();

    let completion = rlm.completion("go").await.unwrap();

    assert_eq!(completion.response, "both happened");
    assert_eq!(completion.iterations.len(), 1);
    assert_eq!(completion.iterations[0].code_blocks[0].result.stdout, "ran\n");
}

#[tokio::test]
async fn test_setup_code_failure_is_fatal() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::with_text("FINAL_ANSWER: unreachable"));
    let config = test_config()
        .with_environment_kwargs(serde_json::json!({"setup_code": "import no_such_module"}));
    let rlm = Rlm::with_backend(backend, config).unwrap();

    let result = rlm.completion("go").await;
    assert!(matches!(result, Err(RlmError::Setup(_))));
}

#[tokio::test]
async fn test_setup_code_runs_before_first_block() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec![
        "```\nprint(seeded)\n```",
        "FINAL_ANSWER: ok",
    ]));
    let config =
        test_config().with_environment_kwargs(serde_json::json!({"setup_code": "seeded = 7"}));
    let rlm = Rlm::with_backend(backend, config).unwrap();

    let completion = rlm.completion("go").await.unwrap();
    assert_eq!(completion.iterations[0].code_blocks[0].result.stdout, "7\n");
}

#[tokio::test]
async fn test_persistent_environment_across_drivers() {
    if !python_available().await {
        return;
    }
    let mut env = LocalEnv::new(LocalConfig::default(), "127.0.0.1:1".parse().unwrap());

    let first = Arc::new(MockBackend::new(vec![
        "```\ncounter = 1\n```",
        "FINAL_ANSWER: stored",
    ]));
    let rlm = Rlm::with_backend(first, test_config()).unwrap();
    rlm.completion_in("store something", &mut env).await.unwrap();

    // A fresh driver (fresh handler, fresh port) sees the same namespace.
    let second = Arc::new(MockBackend::new(vec![
        "```\nprint(counter + 1)\n```",
        "FINAL_ANSWER: carried over",
    ]));
    let rlm = Rlm::with_backend(second, test_config()).unwrap();
    let completion = rlm.completion_in("read it back", &mut env).await.unwrap();

    assert_eq!(completion.iterations[0].code_blocks[0].result.stdout, "2\n");

    env.teardown().await.unwrap();
}

#[tokio::test]
async fn test_wall_clock_budget_overrides_iterations() {
    if !python_available().await {
        return;
    }
    let backend = Arc::new(MockBackend::new(vec!["never consulted"]));
    let config = test_config()
        .with_max_iterations(50)
        .with_wall_clock(Duration::ZERO);
    let rlm = Rlm::with_backend(backend.clone(), config).unwrap();

    let completion = rlm.completion("go").await.unwrap();

    assert!(completion.iterations.is_empty());
    assert!(completion.metadata.truncated);
    assert_eq!(completion.metadata.stop, StopReason::WallClock);
    assert_eq!(backend.request_count(), 0);
}

/// A backend that never answers in time.
struct StallingBackend;

#[async_trait]
impl LmBackend for StallingBackend {
    async fn complete(&self, _prompt: &PromptInput) -> Result<CompletionOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("the deadline fires first")
    }

    fn name(&self) -> &str {
        "stalling"
    }

    fn model(&self) -> &str {
        "stalling-model"
    }
}

#[tokio::test]
async fn test_per_call_deadline_truncates() {
    if !python_available().await {
        return;
    }
    let config = test_config().with_per_call_timeout(Duration::from_millis(50));
    let rlm = Rlm::with_backend(Arc::new(StallingBackend), config).unwrap();

    let completion = rlm.completion("go").await.unwrap();

    assert!(completion.metadata.truncated);
    assert_eq!(completion.metadata.stop, StopReason::Timeout);
    assert!(completion.iterations.is_empty());
}

#[tokio::test]
async fn test_backend_error_propagates_after_teardown() {
    if !python_available().await {
        return;
    }
    // An exhausted mock fails the first LM call.
    let backend = Arc::new(MockBackend::new(vec![]));
    let rlm = Rlm::with_backend(backend, test_config()).unwrap();

    let result = rlm.completion("go").await;
    assert!(matches!(result, Err(RlmError::Backend(_))));
}

#[tokio::test]
async fn test_trajectory_records_are_emitted() {
    if !python_available().await {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trajectory.jsonl");
    let sink = Arc::new(ouro_tracing::FileSink::new(&path).unwrap());

    let backend = Arc::new(MockBackend::with_text("FINAL_ANSWER: traced"));
    let rlm = Rlm::with_backend(backend, test_config())
        .unwrap()
        .with_sink(sink);
    rlm.completion("go").await.unwrap();

    let records = ouro_tracing::TrajectoryWriter::read_records(&path).unwrap();
    let events: Vec<&str> = records.iter().map(|r| r.event_name()).collect();
    assert_eq!(events, vec!["metadata", "iteration", "done"]);
}
