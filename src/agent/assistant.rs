//! Agent backed by an `OpenAI`-compatible Chat Completions endpoint.

use futures::StreamExt;

use super::{Agent, AgentFailure, AgentReply, TurnOutcome};
use crate::conversation::{Message, Role, Usage};

/// LLM connection and model settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// System prompt prepended to every request.
    pub system_prompt: String,
}

/// Streams one completion per turn and records the reported token usage.
#[derive(Clone)]
pub struct LlmAssistant {
    name: String,
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for LlmAssistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAssistant")
            .field("name", &self.name)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl LlmAssistant {
    #[must_use]
    pub fn new(name: impl Into<String>, settings: LlmSettings) -> Self {
        Self {
            name: name.into(),
            http: reqwest::Client::new(),
            settings,
        }
    }

    /// Chat Completions messages for `history`, seen from this agent.
    ///
    /// Own turns become `assistant`; everyone else speaks as `user`.
    fn request_messages(&self, history: &[Message]) -> Vec<serde_json::Value> {
        let mut out = Vec::with_capacity(history.len() + 1);
        if !self.settings.system_prompt.is_empty() {
            out.push(serde_json::json!({
                "role": "system",
                "content": self.settings.system_prompt,
            }));
        }
        for message in history {
            let own = message.role != Role::Human && message.source.as_deref() == Some(&self.name);
            out.push(serde_json::json!({
                "role": if own { "assistant" } else { "user" },
                "content": message.content,
            }));
        }
        out
    }

    async fn complete(&self, history: &[Message]) -> anyhow::Result<AgentReply> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        );

        let body = serde_json::json!({
            "model": self.settings.model,
            "stream": true,
            "stream_options": { "include_usage": true },
            "messages": self.request_messages(history),
        });

        let mut rb = self.http.post(&url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb.send().await?.error_for_status()?;
        let mut byte_stream = resp.bytes_stream();

        let mut buf = Vec::<u8>::new();
        let mut accum = CompletionAccum::default();
        while let Some(chunk) = byte_stream.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = find_double_newline(&buf) {
                let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                accum.push_frame(&String::from_utf8_lossy(&frame))?;
            }
        }
        if !buf.is_empty() {
            accum.push_frame(&String::from_utf8_lossy(&buf))?;
        }

        accum.finish()
    }
}

#[async_trait::async_trait]
impl Agent for LlmAssistant {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(level = "debug", skip_all, fields(agent = %self.name, model = %self.settings.model))]
    async fn take_turn(&self, history: &[Message]) -> TurnOutcome {
        match self.complete(history).await {
            Ok(reply) => TurnOutcome::Message(reply),
            Err(err) => {
                tracing::warn!(error = %err, "completion failed");
                TurnOutcome::Failure(AgentFailure::from(err))
            }
        }
    }
}

/// Content and usage assembled from streamed chunks.
#[derive(Debug, Default)]
struct CompletionAccum {
    content: String,
    usage: Option<Usage>,
}

impl CompletionAccum {
    fn push_frame(&mut self, text: &str) -> anyhow::Result<()> {
        for line in text.lines() {
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let v: serde_json::Value = serde_json::from_str(data)?;
            if let Some(err) = v.get("error") {
                anyhow::bail!("provider error: {err}");
            }
            if let Some(s) = v["choices"][0]["delta"]["content"].as_str() {
                self.content.push_str(s);
            }
            if let Some(u) = v.get("usage").filter(|u| u.is_object()) {
                self.usage = Some(Usage {
                    prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
                    completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
                });
            }
        }
        Ok(())
    }

    fn finish(self) -> anyhow::Result<AgentReply> {
        if self.content.trim().is_empty() {
            anyhow::bail!("model returned an empty completion");
        }
        Ok(AgentReply {
            content: self.content,
            usage: self.usage,
        })
    }
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LlmSettings {
        LlmSettings {
            base_url: "http://localhost:1".into(),
            api_key: None,
            model: "test-model".into(),
            system_prompt: "Be brief.".into(),
        }
    }

    #[test]
    fn deltas_and_usage_accumulate() {
        let mut accum = CompletionAccum::default();
        accum
            .push_frame("data: {\"choices\":[{\"delta\":{\"content\":\"Once \"}}]}\n\n")
            .unwrap();
        accum
            .push_frame("data: {\"choices\":[{\"delta\":{\"content\":\"upon\"}}]}\n\n")
            .unwrap();
        accum
            .push_frame(
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3}}\n\ndata: [DONE]\n\n",
            )
            .unwrap();

        let reply = accum.finish().unwrap();
        assert_eq!(reply.content, "Once upon");
        assert_eq!(
            reply.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn provider_errors_and_empty_completions_fail() {
        let mut accum = CompletionAccum::default();
        assert!(accum.push_frame("data: {\"error\":{\"message\":\"quota\"}}\n\n").is_err());
        assert!(CompletionAccum::default().finish().is_err());
    }

    #[test]
    fn own_turns_map_to_assistant_role() {
        let agent = LlmAssistant::new("assistant", settings());
        let history = vec![
            Message::human("tell me a story"),
            Message::agent(Role::SystemAgent, "assistant", "Once upon a time"),
            Message::agent(Role::CounterpartAgent, "critic", "Shorter please"),
        ];
        let msgs = agent.request_messages(&history);
        let roles: Vec<&str> = msgs.iter().filter_map(|m| m["role"].as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_failure_outcome() {
        let agent = LlmAssistant::new("assistant", settings());
        let outcome = agent.take_turn(&[Message::human("hi")]).await;
        assert!(matches!(outcome, TurnOutcome::Failure(_)));
    }
}
