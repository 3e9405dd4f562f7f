#[path = "support/scripted_model.rs"]
mod scripted_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustic_agent::{
    Agent, AgentError, FunctionTool, ModelResponse, RunInput, ToolCallPart, ToolError, Usage,
    UsageError, UsageLimits,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use scripted_support::ScriptedModel;

#[derive(Debug, Deserialize, JsonSchema)]
struct PingArgs {}

fn ping_call(id: &str) -> ModelResponse {
    ModelResponse::from_tool_call(ToolCallPart::new("ping", json!({})).with_id(id))
}

fn agent_with_ping(model: Arc<ScriptedModel>, seen_requests: Arc<AtomicU64>) -> Agent<()> {
    let mut agent = Agent::<()>::new(model);
    agent
        .tool(
            FunctionTool::new("ping", "Replies pong", move |ctx, _args: PingArgs| {
                let seen_requests = Arc::clone(&seen_requests);
                async move {
                    seen_requests.store(ctx.usage.requests, Ordering::SeqCst);
                    Ok::<_, ToolError>("pong")
                }
            })
            .expect("tool"),
        )
        .expect("register");
    agent
}

#[tokio::test]
async fn request_limit_stops_before_calling_the_model() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ping_call("p1"), ModelResponse::from_text("done")],
    ));
    let agent = agent_with_ping(model.clone(), Arc::new(AtomicU64::new(0)));
    let input = RunInput::builder(())
        .prompt("ping")
        .usage_limits(UsageLimits {
            request_limit: Some(1),
            ..UsageLimits::unlimited()
        })
        .build();

    let err = agent.run(input).await.expect_err("limit reached");

    assert!(matches!(
        err,
        AgentError::Usage(UsageError::RequestLimitExceeded { limit: 1 })
    ));
    assert_eq!(model.request_count().await, 1);
}

#[tokio::test]
async fn total_token_limit_is_checked_after_each_response() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ping_call("p1"), ModelResponse::from_text("done")],
    ));
    let agent = agent_with_ping(model.clone(), Arc::new(AtomicU64::new(0)));
    let input = RunInput::builder(())
        .prompt("ping")
        .usage_limits(UsageLimits {
            total_tokens_limit: Some(20),
            ..UsageLimits::default()
        })
        .build();

    let err = agent.run(input).await.expect_err("limit reached");

    match err {
        AgentError::Usage(UsageError::TotalTokensLimitExceeded { limit, used }) => {
            assert_eq!(limit, 20);
            assert_eq!(used, 30);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(model.request_count().await, 2);
}

#[tokio::test]
async fn response_token_limit_fails_on_the_first_response() {
    let model = Arc::new(
        ScriptedModel::new("scripted", vec![ModelResponse::from_text("long answer")])
            .with_usage(Usage::new(3, 9)),
    );
    let agent = Agent::<()>::new(model);
    let input = RunInput::builder(())
        .prompt("talk")
        .usage_limits(UsageLimits {
            response_tokens_limit: Some(8),
            ..UsageLimits::default()
        })
        .build();

    let err = agent.run(input).await.expect_err("limit reached");

    assert!(matches!(
        err,
        AgentError::Usage(UsageError::ResponseTokensLimitExceeded { limit: 8, used: 9 })
    ));
}

#[tokio::test]
async fn tools_see_usage_accumulated_so_far() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ping_call("p1"), ping_call("p2"), ModelResponse::from_text("done")],
    ));
    let seen = Arc::new(AtomicU64::new(0));
    let agent = agent_with_ping(model, seen.clone());

    let result = agent
        .run(RunInput::new("ping twice", ()))
        .await
        .expect("run");

    assert_eq!(result.data, "done");
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(result.usage.requests, 3);
    assert_eq!(result.usage.request_tokens, 30);
    assert_eq!(result.usage.response_tokens, 15);
}

#[test]
fn limits_round_trip_through_json() {
    let limits: UsageLimits =
        serde_json::from_str(r#"{"total_tokens_limit": 100}"#).expect("limits");
    assert_eq!(limits.request_limit, Some(50));
    assert_eq!(limits.total_tokens_limit, Some(100));
    assert!(limits.has_token_limits());
    assert!(!UsageLimits::default().has_token_limits());
}
