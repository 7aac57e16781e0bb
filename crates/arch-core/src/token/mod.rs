//! Token Meter (spec §4.3): parses an agent's structured output stream
//! line by line and accumulates token counts and monetary cost against a
//! loadable pricing table.
//!
//! Mirrors the shape of the teacher's `claude_code.rs` JSONL parser --
//! discriminate on a top-level `"type"` field, tolerate unknown types by
//! skipping with a debug log -- but the event vocabulary and the cost
//! arithmetic are this component's own, since the teacher has no pricing
//! concept at all (its "token" module is an auth scheme, not a meter).

use serde_json::Value;

use crate::config::PricingTable;
use crate::error::TokenError;
use crate::harness::types::{AgentEvent, UsageReading};

/// Parse one line of an agent's structured output stream.
///
/// Recognised top-level `"type"` values: `"assistant"` (text + inline
/// tool_use blocks), `"tool_use"`, `"tool_result"`, `"usage"` (the four
/// token counters), `"result"` (terminal; carries `session_id` as the
/// resume token), `"error"`. Anything else is tolerated and produces no
/// event, mirroring the teacher's "ignore but log" treatment of unknown
/// event types.
pub fn parse_event_line(line: &str, model_id: &str) -> Result<Vec<AgentEvent>, TokenError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let v: Value = serde_json::from_str(line).map_err(|_| TokenError::MalformedLine(line.to_string()))?;
    let event_type = v.get("type").and_then(Value::as_str).unwrap_or("");

    let mut events = Vec::new();

    match event_type {
        "assistant" => {
            if let Some(message) = v.get("message") {
                if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str).unwrap_or("") {
                            "text" => {
                                if let Some(text) = block.get("text").and_then(Value::as_str) {
                                    events.push(AgentEvent::Message {
                                        role: "assistant".to_string(),
                                        content: text.to_string(),
                                    });
                                }
                            }
                            "tool_use" => {
                                let tool = block
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown")
                                    .to_string();
                                let input = block.get("input").cloned().unwrap_or(Value::Null);
                                events.push(AgentEvent::ToolCall { tool, input });
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        "tool_use" => {
            let tool = v
                .get("name")
                .or_else(|| v.get("tool"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = v.get("input").cloned().unwrap_or(Value::Null);
            events.push(AgentEvent::ToolCall { tool, input });
        }
        "tool_result" => {
            let tool = v
                .get("name")
                .or_else(|| v.get("tool"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let output = v
                .get("output")
                .or_else(|| v.get("content"))
                .cloned()
                .unwrap_or(Value::Null);
            events.push(AgentEvent::ToolResult { tool, output });
        }
        "usage" => {
            let reading = UsageReading {
                input_tokens: field_u64(&v, "input_tokens"),
                output_tokens: field_u64(&v, "output_tokens"),
                cache_read_tokens: field_u64(&v, "cache_read_input_tokens"),
                cache_creation_tokens: field_u64(&v, "cache_creation_input_tokens"),
            };
            events.push(AgentEvent::Usage {
                model_id: model_id.to_string(),
                reading,
            });
        }
        "result" => {
            let resume_token = v
                .get("session_id")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            events.push(AgentEvent::Completed { resume_token });
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .or_else(|| v.get("message").and_then(Value::as_str))
                .unwrap_or("unknown error")
                .to_string();
            events.push(AgentEvent::Error { message });
        }
        other => {
            tracing::debug!(event_type = other, "ignoring unrecognised event type");
        }
    }

    Ok(events)
}

fn field_u64(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Apply a usage reading to a running [`crate::model::UsageSubrecord`],
/// per the cost formula in spec §4.3:
/// `cost += (in/1e6)*price_in + (out/1e6)*price_out + (cache_read/1e6)*price_cache_read + (cache_create/1e6)*price_cache_write`.
pub fn apply_usage(
    usage: &mut crate::model::UsageSubrecord,
    reading: UsageReading,
    model_id: &str,
    pricing: &PricingTable,
) {
    let rate = pricing.rate_for(model_id);
    usage.model_id = model_id.to_string();
    usage.input_tokens += reading.input_tokens;
    usage.output_tokens += reading.output_tokens;
    usage.cache_read_tokens += reading.cache_read_tokens;
    usage.cache_creation_tokens += reading.cache_creation_tokens;
    usage.turn_count += 1;

    let delta = (reading.input_tokens as f64 / 1_000_000.0) * rate.price_in
        + (reading.output_tokens as f64 / 1_000_000.0) * rate.price_out
        + (reading.cache_read_tokens as f64 / 1_000_000.0) * rate.price_cache_read
        + (reading.cache_creation_tokens as f64 / 1_000_000.0) * rate.price_cache_write;

    usage.cost_usd += delta;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceRow;
    use crate::model::UsageSubrecord;
    use std::collections::HashMap;

    fn pricing_3_15() -> PricingTable {
        let mut rows = HashMap::new();
        rows.insert(
            "qa-model".to_string(),
            PriceRow {
                price_in: 3.0,
                price_out: 15.0,
                price_cache_read: 0.3,
                price_cache_write: 3.75,
            },
        );
        rows.insert(
            "default".to_string(),
            PriceRow {
                price_in: 1.0,
                price_out: 1.0,
                price_cache_read: 0.0,
                price_cache_write: 0.0,
            },
        );
        PricingTable { rows }
    }

    #[test]
    fn scenario_s2_literal_lines_yield_expected_cost_and_resume_token() {
        let pricing = pricing_3_15();
        let mut usage = UsageSubrecord::default();

        let line1 = r#"{"type":"usage","input_tokens":1000000,"output_tokens":0,"cache_read_input_tokens":0,"cache_creation_input_tokens":0}"#;
        let events1 = parse_event_line(line1, "qa-model").unwrap();
        assert_eq!(events1.len(), 1);
        if let AgentEvent::Usage { model_id, reading } = &events1[0] {
            apply_usage(&mut usage, *reading, model_id, &pricing);
        } else {
            panic!("expected Usage event");
        }

        let line2 = r#"{"type":"result","session_id":"abc123"}"#;
        let events2 = parse_event_line(line2, "qa-model").unwrap();
        assert_eq!(events2.len(), 1);
        let resume_token = match &events2[0] {
            AgentEvent::Completed { resume_token } => resume_token.clone(),
            _ => panic!("expected Completed event"),
        };

        assert!((usage.cost_usd - 3.00).abs() < 1e-9);
        assert_eq!(resume_token.as_deref(), Some("abc123"));
    }

    #[test]
    fn unknown_model_id_falls_back_to_default_row() {
        let pricing = pricing_3_15();
        let mut usage = UsageSubrecord::default();
        let reading = UsageReading {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
        };
        apply_usage(&mut usage, reading, "some-future-model", &pricing);
        assert!((usage.cost_usd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn malformed_line_is_a_typed_error_not_a_panic() {
        let result = parse_event_line("not json at all {{{", "qa-model");
        assert!(matches!(result, Err(TokenError::MalformedLine(_))));
    }

    #[test]
    fn unrecognised_event_type_yields_no_events() {
        let events = parse_event_line(r#"{"type":"ping"}"#, "qa-model").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn blank_line_is_skipped() {
        let events = parse_event_line("   ", "qa-model").unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn assistant_text_and_tool_use_both_extracted() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let events = parse_event_line(line, "qa-model").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], AgentEvent::Message { content, .. } if content == "hi"));
        assert!(matches!(&events[1], AgentEvent::ToolCall { tool, .. } if tool == "Bash"));
    }
}
