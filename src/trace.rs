//! Debug traces recorded for every external call.

use serde::{Deserialize, Serialize};

/// Token usage reported by the language model for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

/// The outbound HTTP request behind an analytics call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCall {
    pub url: String,
    pub method: String,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TraceDetail {
    #[serde(rename = "tokens")]
    Llm(TokenUsage),
    #[serde(rename = "http")]
    Analytics(HttpCall),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugTrace {
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    #[serde(flatten)]
    pub detail: TraceDetail,
}

impl DebugTrace {
    pub fn llm(request: serde_json::Value, response: serde_json::Value, usage: TokenUsage) -> Self {
        Self {
            request,
            response,
            detail: TraceDetail::Llm(usage),
        }
    }

    pub fn analytics(call: HttpCall, response: serde_json::Value) -> Self {
        Self {
            request: serde_json::json!({ "url": call.url, "method": call.method }),
            response,
            detail: TraceDetail::Analytics(call),
        }
    }

    /// Total tokens spent, zero for non-LLM calls.
    pub fn total_tokens(&self) -> u32 {
        match &self.detail {
            TraceDetail::Llm(usage) => usage.total,
            TraceDetail::Analytics(_) => 0,
        }
    }
}
