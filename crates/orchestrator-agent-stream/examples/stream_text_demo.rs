use std::sync::Arc;

use futures::StreamExt as _;
use orchestrator_agent_stream::prelude::*;
use orchestrator_agent_stream::testing::{
    MockLanguageModel, MockStep, finish, stream_start, text_events, tool_call,
};
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AgentError> {
    orchestrator_agent_stream::init_observability();

    let mut answer = text_events("t1", &["It is ", "21°C ", "in Berlin."]);
    answer.push(finish(FinishReason::Stop, Usage::new(40, 9)));
    let model = Arc::new(MockLanguageModel::new(vec![
        MockStep::events(vec![
            stream_start(),
            tool_call("call-1", "weather", r#"{"city":"Berlin"}"#),
            finish(FinishReason::ToolCalls, Usage::new(25, 12)),
        ]),
        MockStep::events(answer),
    ]));

    let weather = Tool::new("weather")
        .description("Current temperature for a city")
        .input_schema(ObjectSchema::new(json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        })))
        .execute_sync(|input, _options| Ok(json!({ "city": input["city"], "celsius": 21 })));

    let result = StreamText::builder(model)
        .system("Answer weather questions using the weather tool.")
        .prompt("How warm is it in Berlin?")
        .tools(ToolSet::new().with(weather))
        .stop_when(step_count_is(3))
        .on_step_finish(|step| println!("[step {} finished: {}]", step.step_number, step.finish_reason))
        .start()?;

    let mut events = result.full_stream();
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::TextDelta { text, .. } => print!("{text}"),
            StreamEvent::ToolCall(call) => println!("-> {}({})", call.tool_name, call.input),
            StreamEvent::ToolResult(result) => println!("<- {}", result.output),
            StreamEvent::Error { error } => eprintln!("stream error: {error}"),
            StreamEvent::Finish { .. } => println!(),
            _ => {}
        }
    }

    println!("total usage: {:?}", result.total_usage().await?);
    Ok(())
}
