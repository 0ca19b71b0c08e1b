//! In-process stand-ins for the language model and Mixpanel.

#![allow(dead_code)]

use async_trait::async_trait;
use eventscope::analytics::{
    AnalyticsApi, AnalyticsResponse, FunnelQuery, PropertyCount, QueryType, RetentionQuery,
    SegmentationQuery,
};
use eventscope::catalog::CatalogStore;
use eventscope::llm::{Completion, CompletionRequest, LanguageModel};
use eventscope::trace::{DebugTrace, HttpCall, TokenUsage};
use eventscope::{InsightError, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub fn usage(input: u32, output: u32) -> TokenUsage {
    TokenUsage {
        input,
        output,
        total: input + output,
    }
}

enum Reply {
    Text(String, TokenUsage),
    Fail(String),
}

/// Replays scripted completions in order and records every request.
#[derive(Default)]
pub struct FakeLlm {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, content: impl Into<String>, usage: TokenUsage) -> Self {
        self.replies
            .get_mut()
            .unwrap()
            .push_back(Reply::Text(content.into(), usage));
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.replies
            .get_mut()
            .unwrap()
            .push_back(Reply::Fail(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Text(content, usage)) => Ok(Completion { content, usage }),
            Some(Reply::Fail(message)) => Err(InsightError::Llm(message)),
            None => Err(InsightError::Llm("no scripted reply left".to_string())),
        }
    }
}

/// Canned Mixpanel responses keyed by event (and property) name.
#[derive(Default)]
pub struct FakeAnalytics {
    pub top_events: Vec<(String, i64)>,
    pub properties: HashMap<String, Vec<(String, i64)>>,
    pub failing_events: Vec<String>,
    pub values: HashMap<(String, String), Vec<Value>>,
    pub query_data: Value,
    pub fail_queries: bool,
    calls: Mutex<Vec<String>>,
}

impl FakeAnalytics {
    pub fn with_events(events: &[(&str, i64)]) -> Self {
        Self {
            top_events: events.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
            ..Default::default()
        }
    }

    pub fn properties(mut self, event: &str, props: &[(&str, i64)]) -> Self {
        self.properties.insert(
            event.to_string(),
            props.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
        );
        self
    }

    pub fn failing(mut self, event: &str) -> Self {
        self.failing_events.push(event.to_string());
        self
    }

    pub fn values(mut self, event: &str, property: &str, values: Vec<Value>) -> Self {
        self.values
            .insert((event.to_string(), property.to_string()), values);
        self
    }

    pub fn query_data(mut self, data: Value) -> Self {
        self.query_data = data;
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn respond(&self, path: &str, params: Vec<(String, String)>) -> Result<AnalyticsResponse> {
        if self.fail_queries {
            return Err(InsightError::AnalyticsApi {
                status: 400,
                body: "bad request".to_string(),
            });
        }
        let call = HttpCall {
            url: format!("https://mixpanel.test/api/query/{}", path),
            method: "GET".to_string(),
            params,
        };
        Ok(AnalyticsResponse {
            trace: DebugTrace::analytics(call, self.query_data.clone()),
            data: self.query_data.clone(),
        })
    }
}

#[async_trait]
impl AnalyticsApi for FakeAnalytics {
    async fn segmentation(&self, query: &SegmentationQuery) -> Result<AnalyticsResponse> {
        self.record(format!(
            "segmentation {} {}..{}",
            query.event, query.from_date, query.to_date
        ));
        self.respond("segmentation", query.to_params())
    }

    async fn retention(&self, query: &RetentionQuery) -> Result<AnalyticsResponse> {
        self.record(format!("retention {}", query.event));
        self.respond("retention", query.to_params())
    }

    async fn funnel(&self, query: &FunnelQuery) -> Result<AnalyticsResponse> {
        self.record(format!("funnels {}", query.funnel_id));
        self.respond("funnels", query.to_params())
    }

    async fn list_events(&self) -> Result<AnalyticsResponse> {
        self.record("events/top".to_string());
        let events: Vec<Value> = self
            .top_events
            .iter()
            .map(|(name, count)| json!({ "event": name, "amount": count }))
            .collect();
        let data = json!({ "events": events, "type": "general" });
        let call = HttpCall {
            url: "https://mixpanel.test/api/query/events/top".to_string(),
            method: "GET".to_string(),
            params: vec![],
        };
        Ok(AnalyticsResponse {
            trace: DebugTrace::analytics(call, data.clone()),
            data,
        })
    }

    async fn list_event_properties(&self, event: &str) -> Result<Vec<PropertyCount>> {
        self.record(format!("events/properties/top {}", event));
        if self.failing_events.iter().any(|e| e == event) {
            return Err(InsightError::AnalyticsApi {
                status: 500,
                body: format!("boom for {}", event),
            });
        }
        Ok(self
            .properties
            .get(event)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, count)| PropertyCount {
                        name: name.clone(),
                        count: Some(*count),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_property_values(&self, event: &str, property: &str) -> Result<Vec<Value>> {
        self.record(format!("events/properties/values {} {}", event, property));
        Ok(self
            .values
            .get(&(event.to_string(), property.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn deep_link(&self, query_type: QueryType) -> String {
        format!("https://mixpanel.com/project/42/view/{}", query_type)
    }
}

pub fn catalog() -> Arc<CatalogStore> {
    Arc::new(CatalogStore::in_memory().unwrap())
}
