//! HTTP-facing request handling, independent of any server.
//!
//! Every response is a JSON envelope with a `success` flag. Validation
//! failures map to 400, unknown ids to 404, everything else to 500.

use crate::analytics::{AnalyticsApi, MixpanelClient};
use crate::catalog::{CatalogStore, DescriptionSource};
use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::{InsightError, Result};
use crate::llm::{LanguageModel, LlmClient};
use crate::pipeline::QueryPipeline;
use crate::workflow::{DescribeTarget, DescriptionWorkflow};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// Shared services behind the HTTP boundary.
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub pipeline: QueryPipeline,
    pub discovery: Discovery,
    pub workflow: DescriptionWorkflow,
}

impl AppState {
    pub fn new(
        catalog: Arc<CatalogStore>,
        analytics: Arc<dyn AnalyticsApi>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            pipeline: QueryPipeline::new(catalog.clone(), analytics.clone(), llm.clone()),
            discovery: Discovery::new(catalog.clone(), analytics),
            workflow: DescriptionWorkflow::new(catalog.clone(), llm),
            catalog,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let catalog = Arc::new(CatalogStore::open(&config.catalog_path)?);
        let llm = LlmClient::new(
            config.openai.api_key.clone(),
            config.openai.model.clone(),
            config.openai.base_url.clone(),
        )
        .with_timeout(config.request_timeout)?;
        let analytics = MixpanelClient::new(
            config.mixpanel.username.clone(),
            config.mixpanel.secret.clone(),
            config.mixpanel.project_id.clone(),
        )
        .with_api_url(config.mixpanel.api_url.clone())
        .with_timeout(config.request_timeout)?;

        Ok(Self::new(catalog, Arc::new(analytics), Arc::new(llm)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.query.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(mut body: Value) -> Self {
        if let Value::Object(map) = &mut body {
            map.insert("success".to_string(), Value::Bool(true));
        }
        Self { status: 200, body }
    }

    fn error(err: &InsightError) -> Self {
        let status = match err {
            InsightError::Validation(_) => 400,
            InsightError::NotFound { .. } => 404,
            _ => 500,
        };
        if status == 500 {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            body: json!({ "success": false, "error": err.to_string() }),
        }
    }

    fn not_found(method: &str, path: &str) -> Self {
        Self {
            status: 404,
            body: json!({
                "success": false,
                "error": format!("Endpoint not found: {} {}", method, path),
            }),
        }
    }
}

/// Body of a direct edit. Any `source` the client sends is ignored: a
/// hand edit is always recorded as `manual`.
#[derive(Debug, Deserialize)]
struct DescriptionUpdate {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfirmBody {
    #[serde(flatten)]
    target: DescribeTarget,
    description: Option<String>,
}

fn parse_id(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| InsightError::Validation(format!("invalid id: {}", raw)))
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: Option<&Value>, hint: &str) -> Result<T> {
    let body = body.ok_or_else(|| InsightError::Validation(hint.to_string()))?;
    serde_json::from_value(body.clone())
        .map_err(|e| InsightError::Validation(format!("{}: {}", hint, e)))
}

fn description_update(body: Option<&Value>) -> Result<String> {
    let update: DescriptionUpdate = parse_body(body, "body must be {description}")?;
    update
        .description
        .ok_or_else(|| InsightError::Validation("description is required".to_string()))
}

fn flag(query: &HashMap<String, String>, key: &str) -> bool {
    matches!(query.get(key).map(String::as_str), Some("true" | "1"))
}

/// Route one request.
pub async fn handle(state: &AppState, request: &ApiRequest) -> ApiResponse {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if request.method == "GET" && segments.as_slice() == ["query"] {
        return handle_query(state, request).await;
    }

    match route(state, request, &segments).await {
        Some(Ok(body)) => ApiResponse::ok(body),
        Some(Err(e)) => ApiResponse::error(&e),
        None => ApiResponse::not_found(&request.method, &request.path),
    }
}

async fn handle_query(state: &AppState, request: &ApiRequest) -> ApiResponse {
    let question = request.query.get("q").map(String::as_str).unwrap_or("");

    match state.pipeline.run(question).await {
        Ok(result) => {
            let mut body = json!({
                "question": result.question,
                "summary": result.summary,
                "data": result.data,
                "mixpanel_link": result.analytics_link,
            });
            if flag(&request.query, "debug") {
                body["debug"] = serde_json::to_value(&result.debug).unwrap_or(Value::Null);
            }
            ApiResponse::ok(body)
        }
        Err(e) => {
            let (status, error, details) = match &e {
                InsightError::Validation(msg) => (400, "Invalid question", msg.clone()),
                InsightError::QueryFailed { source, .. } => {
                    (500, "Failed to process query", source.to_string())
                }
                other => (500, "Failed to process query", other.to_string()),
            };
            ApiResponse {
                status,
                body: json!({ "success": false, "error": error, "details": details }),
            }
        }
    }
}

async fn route(state: &AppState, request: &ApiRequest, segments: &[&str]) -> Option<Result<Value>> {
    let body = request.body.as_ref();
    let result = match (request.method.as_str(), segments) {
        ("GET", ["health"]) => Ok(json!({ "status": "ok" })),

        // Catalog CRUD
        ("GET", ["events"]) => state
            .catalog
            .list_events()
            .map(|events| json!({ "events": events })),
        ("GET", ["events", id]) => get_event(state, id),
        ("PUT", ["events", id]) => parse_id(id).and_then(|id| {
            let description = description_update(body)?;
            state
                .catalog
                .set_event_description(id, &description, DescriptionSource::Manual)?;
            Ok(json!({}))
        }),
        ("DELETE", ["events", id]) => parse_id(id).and_then(|id| {
            state.catalog.delete_event(id)?;
            Ok(json!({}))
        }),
        ("GET", ["properties", id]) => parse_id(id).and_then(|id| {
            let property = state
                .catalog
                .get_property(id)?
                .ok_or_else(|| InsightError::not_found("Property", id))?;
            Ok(json!({ "property": property }))
        }),
        ("PUT", ["properties", id]) => parse_id(id).and_then(|id| {
            let description = description_update(body)?;
            state
                .catalog
                .set_property_description(id, &description, DescriptionSource::Manual)?;
            Ok(json!({}))
        }),

        // Discovery
        ("POST", ["discover", "events"]) => state
            .discovery
            .discover_events()
            .await
            .map(|count| json!({ "count": count })),
        ("POST", ["discover", "properties", id]) => match parse_id(id) {
            Ok(id) => state
                .discovery
                .discover_properties(id)
                .await
                .and_then(|found| Ok(serde_json::to_value(found)?)),
            Err(e) => Err(e),
        },
        ("POST", ["discover", "values", id]) => match parse_id(id) {
            Ok(id) => state
                .discovery
                .discover_values(id)
                .await
                .and_then(|found| Ok(serde_json::to_value(found)?)),
            Err(e) => Err(e),
        },
        ("POST", ["discover", "all"]) => state
            .discovery
            .discover_all()
            .await
            .and_then(|summary| Ok(serde_json::to_value(summary)?)),

        // Two-phase descriptions
        ("POST", ["llm", "preview"]) => {
            match parse_body::<DescribeTarget>(body, "type and id are required") {
                Ok(target) => state.workflow.preview(target).await.map(|preview| {
                    json!({ "description": preview.description, "context": preview.context })
                }),
                Err(e) => Err(e),
            }
        }
        ("POST", ["llm", "confirm"]) => {
            parse_body::<ConfirmBody>(body, "type, id, and description are required").and_then(
                |confirm| {
                    let description = confirm.description.ok_or_else(|| {
                        InsightError::Validation("description is required".to_string())
                    })?;
                    state.workflow.confirm(confirm.target, &description)?;
                    Ok(json!({}))
                },
            )
        }

        // Export
        ("GET", ["export"]) => export(state, request.query.get("format").map(String::as_str)),

        _ => return None,
    };
    Some(result)
}

fn get_event(state: &AppState, raw_id: &str) -> Result<Value> {
    let id = parse_id(raw_id)?;
    let event = state
        .catalog
        .get_event(id)?
        .ok_or_else(|| InsightError::not_found("Event", id))?;
    let properties = state.catalog.get_properties(id)?;
    Ok(json!({ "event": event, "properties": properties }))
}

fn export(state: &AppState, format: Option<&str>) -> Result<Value> {
    match format.unwrap_or("full") {
        "full" => Ok(json!({ "schema": state.catalog.export_full()? })),
        "compact" => Ok(json!({ "context": state.catalog.export_compact()? })),
        other => Err(InsightError::Validation(format!(
            "format must be \"full\" or \"compact\", got \"{}\"",
            other
        ))),
    }
}
