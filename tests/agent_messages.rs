#[path = "support/scripted_model.rs"]
mod scripted_support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustic_agent::{
    Agent, ModelMessage, ModelRequestPart, ModelResponse, ModelSettings, RunInput,
    messages_from_json,
};
use serde_json::json;

use scripted_support::ScriptedModel;

fn system_prompts(message: &ModelMessage) -> Vec<String> {
    match message {
        ModelMessage::Request(request) => request
            .parts
            .iter()
            .filter_map(|part| match part {
                ModelRequestPart::SystemPrompt(part) => Some(part.content.clone()),
                _ => None,
            })
            .collect(),
        ModelMessage::Response(_) => Vec::new(),
    }
}

fn settings(value: serde_json::Value) -> ModelSettings {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[tokio::test]
async fn history_is_continued_without_repeating_system_prompts() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![
            ModelResponse::from_text("hello"),
            ModelResponse::from_text("again"),
        ],
    ));
    let agent = Agent::<()>::new(model.clone()).system_prompt("Be brief.");

    let first = agent.run(RunInput::new("hi", ())).await.expect("first run");
    assert_eq!(first.all_messages().len(), 2);
    assert_eq!(first.new_messages().len(), 2);
    assert_eq!(system_prompts(&first.all_messages()[0]), vec!["Be brief."]);

    let input = RunInput::builder(())
        .prompt("and again")
        .message_history(first.all_messages().to_vec())
        .build();
    let second = agent.run(input).await.expect("second run");

    assert_eq!(second.data, "again");
    assert_eq!(second.all_messages().len(), 4);
    assert_eq!(second.new_messages().len(), 2);
    assert!(system_prompts(&second.new_messages()[0]).is_empty());

    let requests = model.requests().await;
    assert_eq!(requests[1].len(), 3);
}

#[tokio::test]
async fn dynamic_system_prompts_are_recomputed_on_replay() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::from_text("one"), ModelResponse::from_text("two")],
    ));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let agent = Agent::<()>::new(model.clone())
        .system_prompt("Static.")
        .dynamic_system_prompt("clock", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("Evaluation {n}"))
            }
        });

    let first = agent.run(RunInput::new("hi", ())).await.expect("first run");
    assert_eq!(
        system_prompts(&first.all_messages()[0]),
        vec!["Static.", "Evaluation 1"]
    );

    let input = RunInput::builder(())
        .prompt("again")
        .message_history(first.all_messages().to_vec())
        .build();
    let second = agent.run(input).await.expect("second run");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        system_prompts(&second.all_messages()[0]),
        vec!["Static.", "Evaluation 2"]
    );
    let requests = model.requests().await;
    assert_eq!(system_prompts(&requests[1][0]), vec!["Static.", "Evaluation 2"]);
}

#[tokio::test]
async fn prompt_functions_see_deps_and_prompt() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::from_text("ok")],
    ));
    let agent = Agent::<String>::new(model).system_prompt_fn(|ctx| async move {
        Ok(format!("User {} asked: {}", ctx.deps, ctx.prompt))
    });

    let result = agent
        .run(RunInput::new("what time is it", "ada".to_string()))
        .await
        .expect("run");

    assert_eq!(
        system_prompts(&result.all_messages()[0]),
        vec!["User ada asked: what time is it"]
    );
}

#[tokio::test]
async fn messages_round_trip_through_json() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::from_text("hello")],
    ));
    let agent = Agent::<()>::new(model).system_prompt("Be brief.");

    let result = agent
        .run(RunInput::builder(()).prompt("hi").run_id("run-42").build())
        .await
        .expect("run");

    assert_eq!(result.run_id, "run-42");
    let json = result.all_messages_json().expect("json");
    let restored = messages_from_json(&json).expect("restore");
    assert_eq!(restored, result.all_messages());

    let value: serde_json::Value = serde_json::from_str(&json).expect("value");
    assert_eq!(value[0]["kind"], "request");
    assert_eq!(value[0]["parts"][0]["part_kind"], "system-prompt");
    assert_eq!(value[1]["kind"], "response");
    assert_eq!(value[1]["model_name"], "scripted");
}

#[tokio::test]
async fn run_settings_are_merged_over_agent_settings() {
    let model = Arc::new(ScriptedModel::new(
        "scripted",
        vec![ModelResponse::from_text("ok")],
    ));
    let agent = Agent::<()>::new(model.clone())
        .model_settings(settings(json!({"temperature": 0.5, "max_tokens": 100})));

    let input = RunInput::builder(())
        .prompt("hi")
        .model_settings(settings(json!({"max_tokens": 10})))
        .build();
    agent.run(input).await.expect("run");

    let seen = model.settings().await;
    assert_eq!(
        seen[0],
        Some(settings(json!({"temperature": 0.5, "max_tokens": 10})))
    );
}
