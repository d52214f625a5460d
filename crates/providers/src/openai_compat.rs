//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, DeepSeek, Ollama, vLLM, and any other endpoint that
//! follows the OpenAI chat completions contract. DeepSeek reports prompt
//! cache hits via `prompt_cache_hit_tokens`; OpenAI via
//! `prompt_tokens_details.cached_tokens`. Both are folded into
//! `Usage::cache_read_tokens`.

use serde_json::Value;

use rv_domain::capability::{LlmCapabilities, PromptCacheSupport};
use rv_domain::error::{Error, Result};
use rv_domain::message::{Message, Role, ToolCall, ToolDefinition};
use rv_domain::stream::{BoxStream, StreamEvent, Usage};

use crate::traits::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider,
};
use crate::util::{classify_status, from_reqwest, retry_after_ms};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        timeout_seconds: u64,
    ) -> Result<Self> {
        let capabilities = LlmCapabilities {
            supports_tools: true,
            supports_streaming: true,
            prompt_cache: PromptCacheSupport::Automatic,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            capabilities,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": req.model.clone().unwrap_or_else(|| self.default_model.clone()),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
            "content": msg.text(),
        }),
        Role::Assistant if msg.has_tool_calls() => {
            let tool_calls: Vec<Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            serde_json::json!({
                "role": "assistant",
                "content": msg.content.clone(),
                "tool_calls": tool_calls,
            })
        }
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.text(),
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::LlmFailed {
            provider: provider.to_owned(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::LlmFailed {
        provider: provider.to_owned(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();

    Ok(ChatResponse {
        content,
        tool_calls: parse_tool_calls(message),
        usage: body.get("usage").and_then(parse_usage),
        model: body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_owned(),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(arr) = message.get("tool_calls").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_owned();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_owned();
            let args_str = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

fn parse_usage(v: &Value) -> Option<Usage> {
    // DeepSeek reports cache hits at the top level; OpenAI nests them.
    let cache_read = v
        .get("prompt_cache_hit_tokens")
        .and_then(|c| c.as_u64())
        .or_else(|| {
            v.get("prompt_tokens_details")
                .and_then(|d| d.get("cached_tokens"))
                .and_then(|c| c.as_u64())
        })
        .unwrap_or(0) as u32;

    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
        cache_read_tokens: cache_read,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembly state for streamed tool calls. OpenAI identifies streamed call
/// fragments by array index, with the call id present only on the first
/// fragment; this maps indices back to stable ids.
struct StreamState {
    /// index -> (call_id, name, args_buffer)
    active: std::collections::HashMap<u64, (String, String, String)>,
    usage: Option<Usage>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active: std::collections::HashMap::new(),
            usage: None,
        }
    }

    /// Flush buffered tool calls in index order.
    fn finish_tool_calls(&mut self) -> Vec<StreamEvent> {
        let mut entries: Vec<_> = self.active.drain().collect();
        entries.sort_by_key(|(idx, _)| *idx);
        entries
            .into_iter()
            .map(|(_, (call_id, tool_name, args))| {
                let arguments =
                    serde_json::from_str(&args).unwrap_or(Value::Object(Default::default()));
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }
            })
            .collect()
    }
}

fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        let mut events: Vec<Result<StreamEvent>> =
            state.finish_tool_calls().into_iter().map(Ok).collect();
        events.push(Ok(StreamEvent::Done {
            usage: state.usage.take(),
            finish_reason: Some("stop".into()),
        }));
        return events;
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    // Usage-only chunk (stream_options.include_usage): remember it for Done.
    if let Some(usage) = v.get("usage").and_then(parse_usage) {
        state.usage = Some(usage);
    }

    let Some(choice) = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    else {
        return Vec::new();
    };

    let mut events: Vec<Result<StreamEvent>> = Vec::new();
    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned();
                events.push(Ok(StreamEvent::ToolCallStarted {
                    call_id: id.to_owned(),
                    tool_name: name.clone(),
                }));
                state.active.insert(idx, (id.to_owned(), name, String::new()));
            }

            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if let Some((call_id, _, buf)) = state.active.get_mut(&idx) {
                    buf.push_str(args);
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id: call_id.clone(),
                        delta: args.to_owned(),
                    }));
                }
            }
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token {
                text: text.to_owned(),
            }));
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        events.extend(state.finish_tool_calls().into_iter().map(Ok));
        events.push(Ok(StreamEvent::Done {
            usage: state.usage.take().or_else(|| v.get("usage").and_then(parse_usage)),
            finish_reason: Some(fr.to_owned()),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let hint = retry_after_ms(&resp);
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_status(&self.id, status.as_u16(), &text, hint));
        }

        let resp_text = resp.text().await.map_err(from_reqwest)?;
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.id, &resp_json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(req, true);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let hint = retry_after_ms(&resp);
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_status(&self.id, status.as_u16(), &text, hint));
        }

        let mut state = StreamState::new();
        Ok(crate::sse::event_stream(resp, move |data| {
            parse_sse(data, &mut state)
        }))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| "text-embedding-3-small".into());
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({ "model": model, "input": req.input });

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let hint = retry_after_ms(&resp);
            let text = resp.text().await.map_err(from_reqwest)?;
            return Err(classify_status(&self.id, status.as_u16(), &text, hint));
        }

        let resp_text = resp.text().await.map_err(from_reqwest)?;
        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let data = resp_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::LlmFailed {
                provider: self.id.clone(),
                message: "missing 'data' array in embeddings response".into(),
            })?;

        let embeddings: Vec<Vec<f32>> = data
            .iter()
            .filter_map(|item| {
                let embedding = item.get("embedding")?.as_array()?;
                Some(
                    embedding
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect(),
                )
            })
            .collect();

        Ok(EmbeddingsResponse { embeddings })
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_reads_deepseek_cache_hits() {
        let u = parse_usage(&serde_json::json!({
            "prompt_tokens": 120,
            "completion_tokens": 10,
            "total_tokens": 130,
            "prompt_cache_hit_tokens": 100,
        }))
        .unwrap();
        assert_eq!(u.cache_read_tokens, 100);
    }

    #[test]
    fn usage_reads_openai_cached_tokens() {
        let u = parse_usage(&serde_json::json!({
            "prompt_tokens": 120,
            "completion_tokens": 10,
            "total_tokens": 130,
            "prompt_tokens_details": { "cached_tokens": 64 },
        }))
        .unwrap();
        assert_eq!(u.cache_read_tokens, 64);
    }

    #[test]
    fn streamed_tool_call_fragments_reassemble_by_index() {
        let mut state = StreamState::new();
        parse_sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"add","arguments":""}}]}}]}"#,
            &mut state,
        );
        parse_sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":2,"}}]}}]}"#,
            &mut state,
        );
        parse_sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"b\":3}"}}]}}]}"#,
            &mut state,
        );
        let events = parse_sse(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            &mut state,
        );

        let finished = events
            .iter()
            .find_map(|e| match e {
                Ok(StreamEvent::ToolCallFinished {
                    call_id, arguments, ..
                }) => Some((call_id.clone(), arguments.clone())),
                _ => None,
            })
            .expect("tool call must finish before Done");
        assert_eq!(finished.0, "call_1");
        assert_eq!(finished.1, serde_json::json!({"a": 2, "b": 3}));
        assert!(matches!(
            events.last(),
            Some(Ok(StreamEvent::Done { .. }))
        ));
    }

    #[test]
    fn assistant_tool_calls_serialize_to_function_format() {
        let calls = vec![ToolCall {
            id: "tc_1".into(),
            name: "search".into(),
            arguments: serde_json::json!({"q": "x"}),
        }];
        let msg = Message::assistant_with_tools("thinking", calls);
        let v = msg_to_openai(&msg);
        assert_eq!(v["tool_calls"][0]["function"]["name"], "search");
        assert_eq!(v["content"], "thinking");
    }

    #[test]
    fn done_sentinel_flushes_pending_calls() {
        let mut state = StreamState::new();
        parse_sse(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"f","arguments":"{}"}}]}}]}"#,
            &mut state,
        );
        let events = parse_sse("[DONE]", &mut state);
        assert!(events
            .iter()
            .any(|e| matches!(e, Ok(StreamEvent::ToolCallFinished { call_id, .. }) if call_id == "call_9")));
    }
}
