//! Tool-call response parsing round trips and the in-band streaming-parser correctness invariant
//! (§8.1.6: concatenating every yielded token equals the upstream text with `[CALL] {...}` spans
//! stripped).

use futures_util::{stream, StreamExt};
use quack_gateway::gateway::response::{custom, native, UpstreamDelta, UpstreamDeltaToolCall, UpstreamMessage, UpstreamMessageToolCall};
use quack_gateway::gateway::types::{Tool, ToolCallOrError, ToolParameter};
use serde_json::json;
use std::collections::HashMap;

fn noop_tool(name: &str) -> Tool {
    Tool::new(name, "a tool", HashMap::new(), |_params| Box::pin(async { String::new() }))
}

#[tokio::test]
async fn native_parser_coalesces_index_fragmented_deltas_into_one_call() {
    let deltas = vec![
        UpstreamDelta {
            content: None,
            tool_calls: vec![UpstreamDeltaToolCall {
                index: 0,
                id: Some("call_1".to_string()),
                name: Some("weather.get".to_string()),
                arguments: Some("{\"city\":".to_string()),
            }],
            finish_reason: None,
        },
        UpstreamDelta {
            content: None,
            tool_calls: vec![UpstreamDeltaToolCall {
                index: 0,
                id: None,
                name: None,
                arguments: Some("\"nyc\"}".to_string()),
            }],
            finish_reason: Some("tool_calls".to_string()),
        },
    ];

    let tools = vec![noop_tool("weather.get")];
    let mut response = native::parse_stream(stream::iter(deltas), tools);
    let collected: Vec<String> = response.stream().collect().await;
    assert!(collected.is_empty(), "no content tokens were ever yielded");

    let calls = response.tool_calls().await.unwrap();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        ToolCallOrError::Call(call) => {
            assert_eq!(call.id, "call_1");
            assert_eq!(call.tool.name, "weather.get");
            assert_eq!(call.params, json!({"city": "nyc"}));
        }
        other => panic!("expected a resolved call, got {:?}", other),
    }
}

#[tokio::test]
async fn native_parser_reports_unknown_tool_by_name() {
    let message = UpstreamMessage {
        content: String::new(),
        tool_calls: vec![UpstreamMessageToolCall {
            id: "call_9".to_string(),
            name: "ghost.tool".to_string(),
            arguments: "{}".to_string(),
        }],
        finish_reason: Some("tool_calls".to_string()),
    };
    let response = native::parse_buffered(message, vec![noop_tool("real.tool")]);
    let _ = response.stream().collect::<Vec<_>>().await;
    let calls = response.tool_calls().await.unwrap();
    match &calls[0] {
        ToolCallOrError::Error(msg) => assert!(msg.contains("ghost.tool")),
        other => panic!("expected an error string, got {:?}", other),
    }
}

#[tokio::test]
async fn custom_parser_streaming_output_equals_stripped_upstream_text() {
    let upstream_text = "Sure, here you go.[CALL] {\"name\": \"weather.get\", \"parameters\": {\"city\": \"nyc\"}}";
    let deltas: Vec<UpstreamDelta> = upstream_text
        .chars()
        .map(|c| UpstreamDelta {
            content: Some(c.to_string()),
            tool_calls: Vec::new(),
            finish_reason: None,
        })
        .collect();

    let tools = vec![noop_tool("weather.get")];
    let mut response = custom::parse_stream(stream::iter(deltas), tools);
    let yielded: String = response.stream().collect::<Vec<_>>().await.join("");

    assert_eq!(yielded, "Sure, here you go.");

    let calls = response.tool_calls().await.unwrap();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        ToolCallOrError::Call(call) => assert_eq!(call.tool.name, "weather.get"),
        other => panic!("expected a resolved call, got {:?}", other),
    }
}

#[tokio::test]
async fn custom_parser_with_no_tools_never_enters_call_collection() {
    let upstream_text = "plain text with [brackets] but no tools configured";
    let deltas: Vec<UpstreamDelta> = vec![UpstreamDelta {
        content: Some(upstream_text.to_string()),
        tool_calls: Vec::new(),
        finish_reason: None,
    }];

    let mut response = custom::parse_stream(stream::iter(deltas), Vec::new());
    let yielded: String = response.stream().collect::<Vec<_>>().await.join("");
    assert_eq!(yielded, upstream_text);
    assert!(response.tool_calls().await.unwrap().is_empty());
}

#[tokio::test]
async fn custom_parser_surfaces_malformed_call_as_parse_error() {
    let raw = "Done.[CALL] {not json}".to_string();
    let response = custom::parse_buffered(raw, vec![noop_tool("weather.get")]);
    let _ = response.stream().collect::<Vec<_>>().await;
    let calls = response.tool_calls().await.unwrap();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        ToolCallOrError::Error(msg) => assert!(msg.contains("Failed to load tool call")),
        other => panic!("expected a parse-error string, got {:?}", other),
    }
}

#[test]
fn tool_parameter_round_trips_through_tools_to_openai() {
    let mut params = HashMap::new();
    params.insert(
        "city".to_string(),
        ToolParameter {
            param_type: "string".to_string(),
            description: "The city name".to_string(),
        },
    );
    let tool = Tool::new("weather.get", "Look up weather", params, |_p| Box::pin(async { String::new() }));
    let rendered = quack_gateway::gateway::clients::common::tools_to_openai(&[tool]);
    assert_eq!(rendered[0]["function"]["name"], "weather.get");
    assert_eq!(rendered[0]["function"]["parameters"]["properties"]["city"]["type"], "string");
}
