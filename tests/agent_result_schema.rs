#[path = "support/scripted_model.rs"]
mod scripted_support;

use std::sync::Arc;

use rustic_agent::{
    Agent, AgentError, ErrorKind, FunctionTool, ModelMessage, ModelRequestPart, ModelResponse,
    ModelResponsePart, ResultSchema, RetryPromptPart, RetryTarget, RunInput, TextPart,
    ToolCallPart, ToolError,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use scripted_support::ScriptedModel;

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
struct Answer {
    value: i32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
struct Refusal {
    reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Answer(Answer),
    Refusal(Refusal),
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NoArgs {}

fn answer_call(args: serde_json::Value, id: &str) -> ModelResponse {
    ModelResponse::from_tool_call(ToolCallPart::new("final_result", args).with_id(id))
}

fn answer_agent(model: Arc<ScriptedModel>) -> Agent<(), Answer> {
    let schema = ResultSchema::tool("final_result", "The answer").expect("schema");
    Agent::<(), Answer>::with_result_schema(model, schema)
}

fn retry_parts(messages: &[ModelMessage]) -> Vec<RetryPromptPart> {
    messages
        .iter()
        .filter_map(|message| match message {
            ModelMessage::Request(request) => Some(request.parts.iter()),
            ModelMessage::Response(_) => None,
        })
        .flatten()
        .filter_map(|part| match part {
            ModelRequestPart::RetryPrompt(part) => Some(part.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn plain_text_is_rejected_when_a_result_tool_is_required() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            ModelResponse::from_text("it is 4"),
            answer_call(json!({"value": 4}), "r1"),
        ],
    ));
    let agent = answer_agent(model.clone());

    let result = agent.run(RunInput::new("2 + 2?", ())).await.expect("run");

    assert_eq!(result.data, Answer { value: 4 });
    let retries = retry_parts(result.all_messages());
    assert_eq!(retries.len(), 1);
    assert!(retries[0].tool_name.is_none());
    assert!(retries[0].model_response().starts_with(
        "Plain text responses are not permitted, please call one of the functions instead."
    ));

    let params = model.params().await;
    assert!(!params[0].allow_text_result);
    assert_eq!(params[0].result_tools.len(), 1);
    assert_eq!(params[0].result_tools[0].name, "final_result");
}

#[tokio::test]
async fn repeated_plain_text_exhausts_result_retries() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            ModelResponse::from_text("it is 4"),
            ModelResponse::from_text("still 4"),
            answer_call(json!({"value": 4}), "r1"),
        ],
    ));
    let agent = answer_agent(model.clone());

    let err = agent.run(RunInput::new("2 + 2?", ())).await.expect_err("fails");

    assert_eq!(err.kind(), ErrorKind::ResourceExceeded);
    match err {
        AgentError::RetriesExceeded {
            target,
            max_retries,
        } => {
            assert_eq!(target, RetryTarget::Result);
            assert_eq!(max_retries, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let requests = model.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(retry_parts(&requests[1]).len(), 1);
    assert!(retry_parts(&requests[1])[0]
        .model_response()
        .starts_with("Plain text responses are not permitted"));
}

#[tokio::test]
async fn invalid_result_arguments_are_retried_against_the_call() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            answer_call(json!({"value": "four"}), "r1"),
            answer_call(json!({"value": 4}), "r2"),
        ],
    ));
    let agent = answer_agent(model);

    let result = agent.run(RunInput::new("2 + 2?", ())).await.expect("run");

    assert_eq!(result.data, Answer { value: 4 });
    let retries = retry_parts(result.all_messages());
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].tool_name.as_deref(), Some("final_result"));
    assert_eq!(retries[0].tool_call_id.as_deref(), Some("r1"));
}

#[tokio::test]
async fn validators_can_ask_for_another_attempt() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            answer_call(json!({"value": -1}), "r1"),
            answer_call(json!({"value": 3}), "r2"),
        ],
    ));
    let agent = answer_agent(model).result_validator(|_ctx, answer: Answer| async move {
        if answer.value < 0 {
            return Err(ToolError::retry("value must be positive"));
        }
        Ok(Answer {
            value: answer.value * 10,
        })
    });

    let result = agent.run(RunInput::new("pick", ())).await.expect("run");

    assert_eq!(result.data, Answer { value: 30 });
    let retries = retry_parts(result.all_messages());
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].tool_call_id.as_deref(), Some("r1"));
    assert!(retries[0].model_response().starts_with("value must be positive"));
}

#[tokio::test]
async fn result_retries_are_bounded() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            answer_call(json!({}), "r1"),
            answer_call(json!({}), "r2"),
            answer_call(json!({}), "r3"),
        ],
    ));
    let agent = answer_agent(model.clone()).result_retries(1);

    let err = agent.run(RunInput::new("pick", ())).await.expect_err("fails");

    match err {
        AgentError::RetriesExceeded {
            target,
            max_retries,
        } => {
            assert_eq!(target, RetryTarget::Result);
            assert_eq!(max_retries, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(model.request_count().await, 2);
}

#[tokio::test]
async fn unknown_tools_get_a_retry_listing_what_exists() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            ModelResponse::from_tool_call(ToolCallPart::new("missing", json!({})).with_id("m1")),
            answer_call(json!({"value": 1}), "r1"),
        ],
    ));
    let mut agent = answer_agent(model);
    agent
        .tool(
            FunctionTool::new("lookup", "Looks things up", |_ctx, _args: NoArgs| async move {
                Ok::<_, ToolError>("found")
            })
            .expect("tool"),
        )
        .expect("register");

    let result = agent.run(RunInput::new("go", ())).await.expect("run");

    let retries = retry_parts(result.all_messages());
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].tool_name.as_deref(), Some("missing"));
    assert_eq!(retries[0].tool_call_id.as_deref(), Some("m1"));
    assert!(retries[0].model_response().starts_with(
        "Unknown tool name: 'missing'. Available tools: lookup, final_result"
    ));
}

#[tokio::test]
async fn unknown_tool_without_any_tools() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            ModelResponse::from_tool_call(ToolCallPart::new("missing", json!({}))),
            ModelResponse::from_text("ok"),
        ],
    ));
    let agent = Agent::<()>::new(model);

    let result = agent.run(RunInput::new("go", ())).await.expect("run");

    assert_eq!(result.data, "ok");
    let retries = retry_parts(result.all_messages());
    assert!(retries[0]
        .model_response()
        .starts_with("Unknown tool name: 'missing'. No tools available."));
}

#[tokio::test]
async fn empty_responses_are_fatal() {
    for response in [
        ModelResponse::new(Vec::new(), None),
        ModelResponse::new(vec![ModelResponsePart::Text(TextPart::new(""))], None),
    ] {
        let model = Arc::new(ScriptedModel::new("scripted", vec![response]));
        let agent = Agent::<()>::new(model);

        let err = agent.run(RunInput::new("go", ())).await.expect_err("fails");

        match err {
            AgentError::UnexpectedModelBehavior(message) => {
                assert_eq!(message, "Received empty model response");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

#[tokio::test]
async fn text_parts_are_joined_into_the_result() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::new(
            vec![
                ModelResponsePart::Text(TextPart::new("first")),
                ModelResponsePart::Text(TextPart::new("")),
                ModelResponsePart::Text(TextPart::new("second")),
            ],
            None,
        )],
    ));
    let agent = Agent::<()>::new(model);

    let result = agent.run(RunInput::new("go", ())).await.expect("run");

    assert_eq!(result.data, "first\n\nsecond");
}

#[tokio::test]
async fn union_results_pick_the_called_variant() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::from_tool_call(ToolCallPart::new(
            "final_result_refusal",
            json!({"reason": "no idea"}),
        ))],
    ));
    let schema = ResultSchema::<Outcome>::union()
        .variant::<Answer>("answer", "A numeric answer")
        .expect("answer")
        .variant::<Refusal>("refusal", "Why no answer is possible")
        .expect("refusal");
    let agent = Agent::<(), Outcome>::with_result_schema(model.clone(), schema);

    let result = agent.run(RunInput::new("go", ())).await.expect("run");

    assert_eq!(
        result.data,
        Outcome::Refusal(Refusal {
            reason: "no idea".to_string()
        })
    );
    let names: Vec<String> = model.params().await[0]
        .result_tools
        .iter()
        .map(|def| def.name.clone())
        .collect();
    assert_eq!(names, vec!["final_result_answer", "final_result_refusal"]);
}

#[tokio::test]
async fn text_can_be_allowed_alongside_result_tools() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::from_text("{\"value\": 12}")],
    ));
    let schema = ResultSchema::<Answer>::tool("final_result", "The answer")
        .expect("schema")
        .allow_text(true);
    let agent = Agent::<(), Answer>::with_result_schema(model, schema);

    let result = agent.run(RunInput::new("go", ())).await.expect("run");

    assert_eq!(result.data, Answer { value: 12 });
}

#[tokio::test]
async fn result_tool_names_cannot_be_reused_by_function_tools() {
    let model = Arc::new(ScriptedModel::new("scripted", Vec::new()));
    let mut agent = answer_agent(model);

    let err = agent
        .tool(
            FunctionTool::new("final_result", "Clashes", |_ctx, _args: NoArgs| async move {
                Ok::<_, ToolError>(())
            })
            .expect("tool"),
        )
        .expect_err("conflict");

    assert!(matches!(err, AgentError::Config(_)));
}
