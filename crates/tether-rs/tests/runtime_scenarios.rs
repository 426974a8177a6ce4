//! End-to-end tests for the caller-facing runtime API.
//!
//! Every test drives a real `AgentRuntime` against a `ScriptedEndpoint`, so
//! the loop, context manager, cache coordinator and dispatcher all run
//! unmodified.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::Deserialize;

use tether_rs::agent::{AgentRuntime, LoopState, RuntimeConfig, Toggle};
use tether_rs::api::{ModelRequest, ModelResponse, ScriptedEndpoint};
use tether_rs::cache::{CacheConfig, InMemoryCacheBackend};
use tether_rs::context::{ItemOrigin, SummarizerConfig};
use tether_rs::error::{ModelError, RuntimeError};
use tether_rs::history::{Role, ToolErrorKind, Turn, TurnContent};
use tether_rs::tools::{FnTool, ToolRegistry};
use tether_rs::{ToolCall, ToolDef, json_schema_for};

#[derive(Deserialize, JsonSchema)]
struct LookupArgs {
    term: String,
}

fn lookup_def() -> ToolDef {
    ToolDef::new("lookup", "Look up a term", json_schema_for::<LookupArgs>())
}

fn lookup_tools() -> Arc<ToolRegistry> {
    Arc::new(
        ToolRegistry::new()
            .with(FnTool::new(lookup_def(), |args: LookupArgs| async move {
                Ok(format!("definition of {}", args.term))
            }))
            .unwrap(),
    )
}

fn failing_tools() -> Arc<ToolRegistry> {
    Arc::new(
        ToolRegistry::new()
            .with(FnTool::new(lookup_def(), |_args: LookupArgs| async move {
                Err("backend unavailable".to_string())
            }))
            .unwrap(),
    )
}

fn slow_tools(delay: Duration) -> Arc<ToolRegistry> {
    Arc::new(
        ToolRegistry::new()
            .with(FnTool::new(lookup_def(), move |args: LookupArgs| async move {
                tokio::time::sleep(delay).await;
                Ok(format!("slow definition of {}", args.term))
            }))
            .unwrap(),
    )
}

fn config(max_iterations: u32) -> RuntimeConfig {
    RuntimeConfig::new("test/model", NonZeroU32::new(max_iterations).unwrap()).with_retries(0)
}

fn lookup_call(id: &str, arguments: &str) -> ModelResponse {
    ModelResponse::tool_calls(vec![ToolCall::new(id, "lookup", arguments)])
}

fn last_user_text(request: &ModelRequest) -> String {
    request
        .items
        .iter()
        .rev()
        .find(|item| item.role == Role::User)
        .and_then(|item| match &item.content {
            TurnContent::Text(text) => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Answers summarization calls (the ones without tools) with `summary` and
/// everything else with "ok".
fn summarizing_endpoint(summary: &'static str) -> ScriptedEndpoint {
    ScriptedEndpoint::new().with_responder(move |request, _| {
        if request.tools.is_empty() {
            Ok(ModelResponse::text(summary))
        } else {
            Ok(ModelResponse::text("ok"))
        }
    })
}

fn summarizing_config() -> RuntimeConfig {
    config(3).with_summarization(Toggle::enabled(
        SummarizerConfig::default()
            .with_trigger_turns(4)
            .with_retain_recent_turns(2),
    ))
}

// ── Caller API ───────────────────────────────────────────────────────

#[tokio::test]
async fn oldest_pair_is_dropped_to_fit_the_ceiling() {
    // 600-token window minus 100 reserved for output: ceiling 500.
    let config = config(2)
        .with_context_window(600)
        .with_output_reserve(100)
        .with_safety_margin(0);
    let endpoint = Arc::new(ScriptedEndpoint::new().then(ModelResponse::text("ok")));
    let runtime = AgentRuntime::new(endpoint.clone(), config);

    let archived = vec![
        Turn::new(0, Role::User, TurnContent::text("a".repeat(800)), 200),
        Turn::new(1, Role::Assistant, TurnContent::text("b".repeat(800)), 200),
    ];
    let session = runtime
        .resume_session("sys", lookup_tools(), archived)
        .await
        .unwrap();
    // Third turn brings the conversation to 600 tokens.
    runtime.run(&session, "c".repeat(800)).await.unwrap();

    let sent = &endpoint.requests()[0];
    assert_eq!(sent.pinned_instruction.as_deref(), Some("sys"));
    assert_eq!(sent.items.len(), 1, "the oldest user/assistant pair is dropped");
    assert_eq!(last_user_text(sent), "c".repeat(800));
    // "sys" estimates to one token.
    assert!(1 + sent.fresh_tokens() <= 500);

    // The store still holds every turn.
    assert_eq!(session.history().await.len(), 4);
}

#[tokio::test]
async fn invalid_tool_input_is_reported_to_the_model() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(lookup_call("c1", "{}"))
            .then(ModelResponse::text("I need a term to look up.")),
    );
    let runtime = AgentRuntime::new(endpoint.clone(), config(5));
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    let outcome = runtime.run(&session, "look something up").await.unwrap();
    assert_eq!(outcome.answer, "I need a term to look up.");
    assert_eq!(outcome.iterations, 2);

    let history = session.history().await;
    match history[2].content() {
        TurnContent::ToolResult { output, error, .. } => {
            assert_eq!(*error, Some(ToolErrorKind::InvalidToolInput));
            assert!(output.starts_with("[InvalidToolInput]"), "{output}");
        }
        other => panic!("expected a tool result, got {other:?}"),
    }
    // The model saw the failure on its second call.
    let second = &endpoint.requests()[1];
    assert!(second.items.iter().any(|item| matches!(
        &item.content,
        TurnContent::ToolResult { error: Some(ToolErrorKind::InvalidToolInput), .. }
    )));
}

#[tokio::test]
async fn identical_failures_abort_at_the_threshold() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .with_responder(|_, n| Ok(lookup_call(&format!("c{n}"), r#"{"term":"rust"}"#))),
    );
    let runtime = AgentRuntime::new(endpoint.clone(), config(10).with_failure_threshold(5));
    let session = runtime.start_session("sys", failing_tools()).await.unwrap();

    let err = runtime.run(&session, "define rust").await.unwrap_err();
    match err {
        RuntimeError::ToolFailureThresholdExceeded { ref tool, count, .. } => {
            assert_eq!(tool, "lookup");
            assert_eq!(count, 5);
        }
        other => panic!("expected ToolFailureThresholdExceeded, got {other:?}"),
    }
    assert_eq!(err.code(), "TOOL_FAILURE_THRESHOLD_EXCEEDED");
    assert_eq!(endpoint.call_count(), 5);
    assert_eq!(session.state().await, LoopState::Aborted);
    // Every failed result was committed: user + 5 × (request, result).
    assert_eq!(session.history().await.len(), 11);
}

#[tokio::test]
async fn stable_instruction_is_cached_and_reused() {
    let backend = Arc::new(InMemoryCacheBackend::new(4096));
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(ModelResponse::text("first answer"))
            .then(ModelResponse::text("second answer")),
    );
    let runtime = AgentRuntime::new(
        endpoint.clone(),
        config(3).with_cache(Toggle::enabled(CacheConfig::default())),
    )
    .with_cache_backend(backend.clone());

    // 20 000 chars at 4 chars per token: a 5000-token instruction.
    let instruction = "x".repeat(20_000);
    let session = runtime
        .start_session(instruction, lookup_tools())
        .await
        .unwrap();
    runtime.run(&session, "first question").await.unwrap();
    runtime.run(&session, "second question").await.unwrap();

    let sent = endpoint.requests();
    let first_ref = sent[0].cache_ref.clone().expect("first call attaches the new handle");
    assert_eq!(sent[1].cache_ref.as_deref(), Some(first_ref.as_str()));
    for request in &sent {
        assert!(
            request.pinned_instruction.is_none(),
            "the cached instruction is not resent"
        );
    }
    // Second call: only conversation turns travel as fresh content.
    assert_eq!(sent[1].items.len(), 3);
    assert_eq!(last_user_text(&sent[1]), "second question");
    assert_eq!(backend.create_count(), 1);
    assert_eq!(session.cache_id().await, Some(first_ref));
}

// ── Determinism and limits ───────────────────────────────────────────

fn replay_endpoint() -> ScriptedEndpoint {
    ScriptedEndpoint::new()
        .then(ModelResponse::tool_calls(vec![
            ToolCall::new("a", "lookup", r#"{"term":"ownership"}"#),
            ToolCall::new("b", "lookup", r#"{"term":"borrowing"}"#),
        ]))
        .then(lookup_call("c", "{}"))
        .then(ModelResponse::text("Ownership and borrowing explained."))
}

#[tokio::test]
async fn replay_produces_identical_history() {
    let mut histories = Vec::new();
    for _ in 0..2 {
        let runtime = AgentRuntime::new(Arc::new(replay_endpoint()), config(5));
        let session = runtime.start_session("sys", lookup_tools()).await.unwrap();
        runtime.run(&session, "explain").await.unwrap();
        histories.push(session.history().await);
    }

    let (first, second) = (&histories[0], &histories[1]);
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second) {
        assert!(a.same_record(b), "{a:?} != {b:?}");
    }
}

#[tokio::test]
async fn concurrent_tool_results_keep_request_order() {
    let registry = Arc::new(
        ToolRegistry::new()
            .with(FnTool::new(lookup_def(), |args: LookupArgs| async move {
                // The first call finishes last.
                let delay = if args.term == "slow" { 60 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(args.term)
            }))
            .unwrap(),
    );
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(ModelResponse::tool_calls(vec![
                ToolCall::new("1", "lookup", r#"{"term":"slow"}"#),
                ToolCall::new("2", "lookup", r#"{"term":"fast"}"#),
            ]))
            .then(ModelResponse::text("done")),
    );
    let runtime = AgentRuntime::new(endpoint, config(3));
    let session = runtime.start_session("sys", registry).await.unwrap();
    runtime.run(&session, "go").await.unwrap();

    let ids: Vec<String> = session
        .history()
        .await
        .iter()
        .filter_map(|turn| match turn.content() {
            TurnContent::ToolResult { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, ["1", "2"]);
}

#[tokio::test]
async fn iteration_ceiling_is_never_exceeded() {
    for max in [1, 3, 7] {
        let endpoint = Arc::new(ScriptedEndpoint::new().with_responder(|_, n| {
            Ok(lookup_call(&format!("c{n}"), &format!(r#"{{"term":"t{n}"}}"#)))
        }));
        let runtime = AgentRuntime::new(endpoint.clone(), config(max));
        let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

        let err = runtime.run(&session, "loop forever").await.unwrap_err();
        assert_eq!(err, RuntimeError::IterationBudgetExceeded { max });
        assert_eq!(endpoint.call_count(), max as usize);
    }
}

#[tokio::test]
async fn cancel_interrupts_a_pending_model_call() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(ModelResponse::text("too late"))
            .with_delay(Duration::from_secs(5)),
    );
    let runtime = AgentRuntime::new(endpoint, config(3));
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    let canceller = {
        let runtime = runtime.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runtime.cancel(&session);
        })
    };

    let started = Instant::now();
    let err = runtime.run(&session, "hello").await.unwrap_err();
    canceller.await.unwrap();
    assert_eq!(err, RuntimeError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state().await, LoopState::Aborted);

    let again = runtime.run(&session, "hello again").await.unwrap_err();
    assert!(matches!(again, RuntimeError::SessionClosed(_)));
}

#[tokio::test]
async fn cancel_during_tools_commits_results_first() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(lookup_call("c1", r#"{"term":"x"}"#))
            .then(ModelResponse::text("never requested")),
    );
    let runtime = AgentRuntime::new(endpoint.clone(), config(5));
    let session = runtime
        .start_session("sys", slow_tools(Duration::from_millis(200)))
        .await
        .unwrap();

    let canceller = {
        let runtime = runtime.clone();
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            runtime.cancel(&session);
        })
    };

    let err = runtime.run(&session, "look up x").await.unwrap_err();
    canceller.await.unwrap();
    assert_eq!(err, RuntimeError::Cancelled);
    assert_eq!(endpoint.call_count(), 1);

    let history = session.history().await;
    assert_eq!(history.len(), 3);
    match history[2].content() {
        TurnContent::ToolResult { output, error, .. } => {
            assert!(error.is_none());
            assert_eq!(output, "slow definition of x");
        }
        other => panic!("expected the committed tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn session_timeout_bounds_the_run() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(ModelResponse::text("too late"))
            .with_delay(Duration::from_secs(5)),
    );
    let runtime = AgentRuntime::new(
        endpoint,
        config(3).with_session_timeout(Duration::from_millis(100)),
    );
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    let started = Instant::now();
    let err = runtime.run(&session, "hello").await.unwrap_err();
    assert_eq!(err, RuntimeError::SessionTimedOut(Duration::from_millis(100)));
    assert_eq!(err.code(), "SESSION_TIMED_OUT");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn running_tools_cannot_outlast_the_session_timeout() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(lookup_call("c1", r#"{"term":"x"}"#))
            .then(ModelResponse::text("never requested")),
    );
    let runtime = AgentRuntime::new(
        endpoint.clone(),
        config(5).with_session_timeout(Duration::from_millis(100)),
    );
    let session = runtime
        .start_session("sys", slow_tools(Duration::from_secs(2)))
        .await
        .unwrap();

    let started = Instant::now();
    let err = runtime.run(&session, "look up x").await.unwrap_err();
    assert_eq!(err, RuntimeError::SessionTimedOut(Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(endpoint.call_count(), 1);

    // The cut-off call still has its result recorded.
    let history = session.history().await;
    assert_eq!(history.len(), 3);
    match history[2].content() {
        TurnContent::ToolResult { output, error, .. } => {
            assert_eq!(*error, Some(ToolErrorKind::Timeout));
            assert!(output.starts_with("[ToolTimeout]"), "{output}");
        }
        other => panic!("expected a tool result, got {other:?}"),
    }
    assert_eq!(session.state().await, LoopState::Aborted);
}

#[tokio::test]
async fn model_call_timeout_is_reported_as_a_model_error() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(ModelResponse::text("too late"))
            .with_delay(Duration::from_secs(5)),
    );
    let runtime = AgentRuntime::new(
        endpoint,
        config(3).with_model_call_timeout(Duration::from_millis(50)),
    );
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    let err = runtime.run(&session, "hello").await.unwrap_err();
    assert_eq!(err.code(), "MODEL_ERROR");
    assert!(err.to_string().contains("timed out"), "{err}");
}

#[tokio::test]
async fn model_call_timeout_applies_to_each_attempt() {
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(ModelResponse::text("too late"))
            .then(ModelResponse::text("also too late"))
            .with_delay(Duration::from_secs(5)),
    );
    let runtime = AgentRuntime::new(
        endpoint.clone(),
        config(3)
            .with_retries(1)
            .with_model_call_timeout(Duration::from_millis(50)),
    );
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    let err = runtime.run(&session, "hello").await.unwrap_err();
    assert_eq!(
        err,
        RuntimeError::Model(ModelError::Timeout(Duration::from_millis(50)))
    );
    // Both attempts reached the endpoint and each timed out on its own.
    assert_eq!(endpoint.call_count(), 2);
}

#[tokio::test]
async fn sessions_run_in_parallel_without_sharing_state() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .with_responder(move |request, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ModelResponse::text(format!("answer to {}", last_user_text(request))))
            })
            .with_delay(Duration::from_millis(20)),
    );
    let runtime = AgentRuntime::new(endpoint, config(3));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let runtime = runtime.clone();
        tasks.push(tokio::spawn(async move {
            let session = runtime.start_session("sys", lookup_tools()).await.unwrap();
            let outcome = runtime.run(&session, format!("question {i}")).await.unwrap();
            (i, outcome.answer, session.history().await.len())
        }));
    }

    for task in tasks {
        let (i, answer, turns) = task.await.unwrap();
        assert_eq!(answer, format!("answer to question {i}"));
        assert_eq!(turns, 2);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn context_overflow_aborts_without_another_call() {
    // 300-token ceiling; call arguments are never shortened.
    let huge = format!(r#"{{"term":"{}"}}"#, "z".repeat(2_000));
    let endpoint = Arc::new(
        ScriptedEndpoint::new()
            .then(lookup_call("c1", &huge))
            .then(ModelResponse::text("never requested")),
    );
    let config = config(5)
        .with_context_window(400)
        .with_output_reserve(100)
        .with_safety_margin(0);
    let runtime = AgentRuntime::new(endpoint.clone(), config);
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    let err = runtime.run(&session, "look this up").await.unwrap_err();
    assert_eq!(err.code(), "CONTEXT_OVERFLOW");
    assert!(matches!(err, RuntimeError::ContextOverflow { ceiling: 300, .. }));
    assert_eq!(endpoint.call_count(), 1);
    assert_eq!(session.state().await, LoopState::Aborted);
    // The request and its result were committed before composition failed.
    assert_eq!(session.history().await.len(), 3);

    let again = runtime.run(&session, "retry").await.unwrap_err();
    assert!(matches!(again, RuntimeError::SessionClosed(_)));
}

// ── Summaries, caching and resumption ────────────────────────────────

#[tokio::test]
async fn summarization_invalidates_a_conversation_cache() {
    let backend = Arc::new(InMemoryCacheBackend::new(50));
    let endpoint = Arc::new(summarizing_endpoint("the user asked three long questions"));
    let cache = CacheConfig::default()
        .with_min_tokens(50)
        .with_cache_conversation(true);
    let runtime = AgentRuntime::new(
        endpoint.clone(),
        summarizing_config().with_cache(Toggle::enabled(cache)),
    )
    .with_cache_backend(backend.clone());
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();

    // Each question is 100 tokens; "sys" is too small to cache alone.
    for i in 0..3 {
        runtime
            .run(&session, format!("{i}{}", "q".repeat(399)))
            .await
            .unwrap();
    }

    let loop_calls: Vec<ModelRequest> = endpoint
        .requests()
        .into_iter()
        .filter(|r| !r.tools.is_empty())
        .collect();
    assert_eq!(loop_calls.len(), 3);
    assert!(loop_calls[0].cache_ref.is_none(), "nothing to cache yet");
    let first_handle = loop_calls[1]
        .cache_ref
        .clone()
        .expect("second call caches the first exchange");

    // The third run folded the first exchange into a summary.
    assert_eq!(
        session.summary().await.as_deref(),
        Some("the user asked three long questions")
    );
    let third = &loop_calls[2];
    assert_ne!(third.cache_ref.as_deref(), Some(first_handle.as_str()));

    // Remote deletion of the stale handle happens in the background.
    let mut gone = false;
    for _ in 0..50 {
        if !backend.contains(&first_handle) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "stale handle {first_handle} was not deleted");
}

#[tokio::test]
async fn resumed_session_keeps_its_summary() {
    let endpoint = Arc::new(summarizing_endpoint("SUMMARY"));
    let runtime = AgentRuntime::new(endpoint, summarizing_config());
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();
    for i in 0..4 {
        runtime.run(&session, format!("hello {i}")).await.unwrap();
    }
    let report = runtime.end_session(session).await;
    assert_eq!(report.summary.as_deref(), Some("SUMMARY"));
    let boundary = report.summary_boundary;
    assert!(boundary > 0);

    // A fresh runtime that will not summarize again during the next run.
    let resumed_endpoint = Arc::new(summarizing_endpoint("unused"));
    let resumed_config = config(3).with_summarization(Toggle::enabled(
        SummarizerConfig::default().with_trigger_turns(100),
    ));
    let runtime = AgentRuntime::new(resumed_endpoint.clone(), resumed_config);
    let session = runtime
        .resume_session("sys", lookup_tools(), report)
        .await
        .unwrap();
    assert_eq!(session.summary().await.as_deref(), Some("SUMMARY"));

    runtime.run(&session, "after resume").await.unwrap();
    let sent = &resumed_endpoint.requests()[0];
    assert_eq!(sent.items[0].origin, ItemOrigin::Summary);
    match &sent.items[0].content {
        TurnContent::Text(text) => {
            assert!(text.starts_with("<context_summary>"), "{text}");
            assert!(text.contains("SUMMARY"));
        }
        other => panic!("expected the summary item, got {other:?}"),
    }
    let first_turn = sent.items.iter().find_map(|item| match item.origin {
        ItemOrigin::Turn(seq) => Some(seq),
        ItemOrigin::Summary => None,
    });
    assert_eq!(first_turn, Some(boundary));
}

#[tokio::test]
async fn resuming_a_summary_requires_summarization() {
    let endpoint = Arc::new(summarizing_endpoint("SUMMARY"));
    let runtime = AgentRuntime::new(endpoint.clone(), summarizing_config());
    let session = runtime.start_session("sys", lookup_tools()).await.unwrap();
    for i in 0..4 {
        runtime.run(&session, format!("hello {i}")).await.unwrap();
    }
    let report = runtime.end_session(session).await;

    let plain = AgentRuntime::new(endpoint, config(3));
    let err = plain
        .resume_session("sys", lookup_tools(), report)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFIGURATION");
}
