//! Mixpanel query API client.
//!
//! Typed inputs are turned into query-string parameters here; optional
//! parameters are only sent when present. Non-2xx responses surface as
//! [`InsightError::AnalyticsApi`] with the status and body.

use crate::error::{InsightError, Result};
use crate::trace::{DebugTrace, HttpCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

const MIXPANEL_APP_URL: &str = "https://mixpanel.com/project";
const DEFAULT_UNIT: &str = "day";
const DEFAULT_RETENTION_TYPE: &str = "birth";
const TOP_EVENTS_LIMIT: u32 = 100;
const TOP_PROPERTIES_LIMIT: u32 = 100;
const PROPERTY_VALUES_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Segmentation,
    Retention,
    Funnels,
    Events,
}

impl QueryType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "segmentation" => Some(QueryType::Segmentation),
            "retention" => Some(QueryType::Retention),
            "funnels" => Some(QueryType::Funnels),
            "events" => Some(QueryType::Events),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Segmentation => "segmentation",
            QueryType::Retention => "retention",
            QueryType::Funnels => "funnels",
            QueryType::Events => "events",
        }
    }

    /// Whether queries of this type need a date range.
    pub fn is_dated(&self) -> bool {
        !matches!(self, QueryType::Events)
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Params = Vec<(String, String)>;

fn push(params: &mut Params, key: &str, value: impl Into<String>) {
    params.push((key.to_string(), value.into()));
}

fn push_opt(params: &mut Params, key: &str, value: Option<&String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        push(params, key, value.clone());
    }
}

/// Read a parameter as a string; numbers are accepted and rendered as-is.
fn param_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required(params: &Map<String, Value>, key: &str, query_type: QueryType) -> Result<String> {
    param_str(params, key).ok_or_else(|| {
        InsightError::Validation(format!(
            "{} query requires parameter '{}'",
            query_type, key
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationQuery {
    pub event: String,
    /// Inclusive `YYYY-MM-DD` bounds.
    pub from_date: String,
    pub to_date: String,
    /// Property expression to segment by, e.g. `properties["plan"]`.
    pub on: Option<String>,
    /// Mixpanel filter expression.
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    /// `day`, `week` or `month`; sent as `day` when unset.
    pub unit: Option<String>,
}

impl SegmentationQuery {
    pub fn to_params(&self) -> Params {
        let mut params = Vec::new();
        push(&mut params, "event", self.event.clone());
        push(&mut params, "from_date", self.from_date.clone());
        push(&mut params, "to_date", self.to_date.clone());
        push(&mut params, "unit", self.unit.clone().unwrap_or_else(|| DEFAULT_UNIT.to_string()));
        push_opt(&mut params, "on", self.on.as_ref());
        push_opt(&mut params, "where", self.where_clause.as_ref());
        params
    }
}

impl TryFrom<&Map<String, Value>> for SegmentationQuery {
    type Error = InsightError;

    fn try_from(params: &Map<String, Value>) -> Result<Self> {
        let kind = QueryType::Segmentation;
        Ok(Self {
            event: required(params, "event", kind)?,
            from_date: required(params, "from_date", kind)?,
            to_date: required(params, "to_date", kind)?,
            on: param_str(params, "on"),
            where_clause: param_str(params, "where"),
            unit: param_str(params, "unit"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionQuery {
    pub event: String,
    pub from_date: String,
    pub to_date: String,
    pub born_event: Option<String>,
    pub retention_type: Option<String>,
    pub unit: Option<String>,
}

impl RetentionQuery {
    pub fn to_params(&self) -> Params {
        let mut params = Vec::new();
        push(&mut params, "event", self.event.clone());
        push(
            &mut params,
            "retention_type",
            self.retention_type
                .clone()
                .unwrap_or_else(|| DEFAULT_RETENTION_TYPE.to_string()),
        );
        push(&mut params, "from_date", self.from_date.clone());
        push(&mut params, "to_date", self.to_date.clone());
        push(&mut params, "unit", self.unit.clone().unwrap_or_else(|| DEFAULT_UNIT.to_string()));
        push_opt(&mut params, "born_event", self.born_event.as_ref());
        params
    }
}

impl TryFrom<&Map<String, Value>> for RetentionQuery {
    type Error = InsightError;

    fn try_from(params: &Map<String, Value>) -> Result<Self> {
        let kind = QueryType::Retention;
        Ok(Self {
            event: required(params, "event", kind)?,
            from_date: required(params, "from_date", kind)?,
            to_date: required(params, "to_date", kind)?,
            born_event: param_str(params, "born_event"),
            retention_type: param_str(params, "retention_type"),
            unit: param_str(params, "unit"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelQuery {
    pub funnel_id: String,
    pub from_date: String,
    pub to_date: String,
    pub unit: Option<String>,
}

impl FunnelQuery {
    pub fn to_params(&self) -> Params {
        let mut params = Vec::new();
        push(&mut params, "funnel_id", self.funnel_id.clone());
        push(&mut params, "from_date", self.from_date.clone());
        push(&mut params, "to_date", self.to_date.clone());
        push(&mut params, "unit", self.unit.clone().unwrap_or_else(|| DEFAULT_UNIT.to_string()));
        params
    }
}

impl TryFrom<&Map<String, Value>> for FunnelQuery {
    type Error = InsightError;

    fn try_from(params: &Map<String, Value>) -> Result<Self> {
        let kind = QueryType::Funnels;
        Ok(Self {
            funnel_id: required(params, "funnel_id", kind)?,
            from_date: required(params, "from_date", kind)?,
            to_date: required(params, "to_date", kind)?,
            unit: param_str(params, "unit"),
        })
    }
}

/// Raw JSON from a primary query plus the trace of the call that produced it.
#[derive(Debug, Clone)]
pub struct AnalyticsResponse {
    pub data: Value,
    pub trace: DebugTrace,
}

/// One entry of the top-events listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEvent {
    pub name: String,
    pub count: Option<i64>,
}

/// Parse `{"events": [{"event": "...", "amount": n}, ...]}`.
pub fn parse_top_events(data: &Value) -> Vec<TopEvent> {
    data.get("events")
        .and_then(Value::as_array)
        .map(|events| {
            events
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("event")?.as_str()?.to_string();
                    let count = entry.get("amount").and_then(Value::as_i64);
                    Some(TopEvent { name, count })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCount {
    pub name: String,
    pub count: Option<i64>,
}

/// Reshape a `name → count` mapping into a sequence sorted by count (desc)
/// then name. Counts may be bare numbers or `{"count": n}` objects.
pub fn reshape_property_counts(data: &Value) -> Result<Vec<PropertyCount>> {
    let mapping = data.as_object().ok_or_else(|| {
        InsightError::UnexpectedResponse(format!("expected property mapping, got: {}", data))
    })?;

    let mut properties: Vec<PropertyCount> = mapping
        .iter()
        .map(|(name, value)| {
            let count = value
                .as_i64()
                .or_else(|| value.get("count").and_then(Value::as_i64));
            PropertyCount {
                name: name.clone(),
                count,
            }
        })
        .collect();

    properties.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    Ok(properties)
}

#[async_trait]
pub trait AnalyticsApi: Send + Sync {
    async fn segmentation(&self, query: &SegmentationQuery) -> Result<AnalyticsResponse>;

    async fn retention(&self, query: &RetentionQuery) -> Result<AnalyticsResponse>;

    async fn funnel(&self, query: &FunnelQuery) -> Result<AnalyticsResponse>;

    async fn list_events(&self) -> Result<AnalyticsResponse>;

    async fn list_event_properties(&self, event: &str) -> Result<Vec<PropertyCount>>;

    async fn list_property_values(&self, event: &str, property: &str) -> Result<Vec<Value>>;

    /// Link into the Mixpanel UI for a query type. Filters are not encoded.
    fn deep_link(&self, query_type: QueryType) -> String;
}

#[derive(Clone)]
pub struct MixpanelClient {
    http: reqwest::Client,
    api_url: String,
    username: String,
    secret: String,
    project_id: String,
}

impl MixpanelClient {
    pub fn new(username: String, secret: String, project_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: "https://mixpanel.com/api/query".to_string(),
            username,
            secret,
            project_id,
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn get(&self, path: &str, mut params: Params) -> Result<AnalyticsResponse> {
        params.insert(0, ("project_id".to_string(), self.project_id.clone()));
        let url = format!("{}/{}", self.api_url, path);
        debug!(url = %url, params = ?params, "Mixpanel request");

        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "Mixpanel API error");
            return Err(InsightError::AnalyticsApi {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = response.json().await?;
        let call = HttpCall {
            url,
            method: "GET".to_string(),
            params,
        };
        Ok(AnalyticsResponse {
            trace: DebugTrace::analytics(call, data.clone()),
            data,
        })
    }
}

#[async_trait]
impl AnalyticsApi for MixpanelClient {
    async fn segmentation(&self, query: &SegmentationQuery) -> Result<AnalyticsResponse> {
        self.get("segmentation", query.to_params()).await
    }

    async fn retention(&self, query: &RetentionQuery) -> Result<AnalyticsResponse> {
        self.get("retention", query.to_params()).await
    }

    async fn funnel(&self, query: &FunnelQuery) -> Result<AnalyticsResponse> {
        self.get("funnels", query.to_params()).await
    }

    async fn list_events(&self) -> Result<AnalyticsResponse> {
        let mut params = Vec::new();
        push(&mut params, "type", "general");
        push(&mut params, "limit", TOP_EVENTS_LIMIT.to_string());
        self.get("events/top", params).await
    }

    async fn list_event_properties(&self, event: &str) -> Result<Vec<PropertyCount>> {
        let mut params = Vec::new();
        push(&mut params, "event", event);
        push(&mut params, "limit", TOP_PROPERTIES_LIMIT.to_string());
        let response = self.get("events/properties/top", params).await?;
        reshape_property_counts(&response.data)
    }

    async fn list_property_values(&self, event: &str, property: &str) -> Result<Vec<Value>> {
        let mut params = Vec::new();
        push(&mut params, "event", event);
        push(&mut params, "name", property);
        push(&mut params, "limit", PROPERTY_VALUES_LIMIT.to_string());
        let response = self.get("events/properties/values", params).await?;
        match response.data {
            Value::Array(values) => Ok(values),
            other => Err(InsightError::UnexpectedResponse(format!(
                "expected list of property values, got: {}",
                other
            ))),
        }
    }

    fn deep_link(&self, query_type: QueryType) -> String {
        let base = format!("{}/{}", MIXPANEL_APP_URL, self.project_id);
        match query_type {
            QueryType::Events => base,
            other => format!("{}/view/{}", base, other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn keys(params: &Params) -> Vec<&str> {
        params.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn test_segmentation_omits_absent_optionals() {
        let query = SegmentationQuery::try_from(&map(json!({
            "event": "Signup",
            "from_date": "2024-01-01",
            "to_date": "2024-01-07"
        })))
        .unwrap();

        let params = query.to_params();
        assert_eq!(keys(&params), vec!["event", "from_date", "to_date", "unit"]);
        assert_eq!(params[3].1, "day");
    }

    #[test]
    fn test_segmentation_includes_on_and_where() {
        let query = SegmentationQuery::try_from(&map(json!({
            "event": "Signup",
            "from_date": "2024-01-01",
            "to_date": "2024-01-07",
            "on": "properties[\"plan\"]",
            "where": "properties[\"country\"] == \"US\"",
            "unit": "week"
        })))
        .unwrap();

        let params = query.to_params();
        assert_eq!(keys(&params), vec!["event", "from_date", "to_date", "unit", "on", "where"]);
        assert_eq!(params[3].1, "week");
    }

    #[test]
    fn test_missing_required_param_is_validation_error() {
        let err = SegmentationQuery::try_from(&map(json!({
            "funnel_id": 7,
            "from_date": "2024-01-01",
            "to_date": "2024-01-07"
        })))
        .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("'event'"));
    }

    #[test]
    fn test_retention_born_event_optional() {
        let base = json!({"event": "Login", "from_date": "2024-01-01", "to_date": "2024-01-31"});
        let without = RetentionQuery::try_from(&map(base.clone())).unwrap().to_params();
        assert!(!keys(&without).contains(&"born_event"));
        assert!(without.contains(&("retention_type".to_string(), "birth".to_string())));

        let mut with = base;
        with["born_event"] = json!("Signup");
        let with = RetentionQuery::try_from(&map(with)).unwrap().to_params();
        assert!(with.contains(&("born_event".to_string(), "Signup".to_string())));
    }

    #[test]
    fn test_funnel_id_accepts_number() {
        let query = FunnelQuery::try_from(&map(json!({
            "funnel_id": 12345,
            "from_date": "2024-01-01",
            "to_date": "2024-01-07"
        })))
        .unwrap();
        assert_eq!(query.funnel_id, "12345");
    }

    #[test]
    fn test_reshape_property_counts_sorted() {
        let data = json!({
            "plan": {"count": 10},
            "referrer": 25,
            "coupon": {"count": 10}
        });
        let properties = reshape_property_counts(&data).unwrap();
        let names: Vec<&str> = properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["referrer", "coupon", "plan"]);
        assert_eq!(properties[0].count, Some(25));
    }

    #[test]
    fn test_reshape_rejects_non_mapping() {
        let err = reshape_property_counts(&json!(["a", "b"])).unwrap_err();
        assert!(matches!(err, InsightError::UnexpectedResponse(_)));
        assert!(err.to_string().contains("expected property mapping"));
    }

    #[test]
    fn test_parse_top_events() {
        let data = json!({
            "events": [
                {"event": "Signup", "amount": 120, "percent_change": 0.1},
                {"event": "Login", "amount": 80},
                {"amount": 3}
            ],
            "type": "general"
        });
        let events = parse_top_events(&data);
        assert_eq!(
            events,
            vec![
                TopEvent { name: "Signup".to_string(), count: Some(120) },
                TopEvent { name: "Login".to_string(), count: Some(80) },
            ]
        );
        assert!(parse_top_events(&json!({})).is_empty());
    }

    #[test]
    fn test_deep_link_depends_only_on_type() {
        let client = MixpanelClient::new("svc".into(), "secret".into(), "42".into());
        assert_eq!(
            client.deep_link(QueryType::Segmentation),
            "https://mixpanel.com/project/42/view/segmentation"
        );
        assert_eq!(
            client.deep_link(QueryType::Funnels),
            "https://mixpanel.com/project/42/view/funnels"
        );
        assert_eq!(client.deep_link(QueryType::Events), "https://mixpanel.com/project/42");
    }

    #[test]
    fn test_query_type_parse() {
        assert_eq!(QueryType::parse("Retention"), Some(QueryType::Retention));
        assert_eq!(QueryType::parse("insights"), None);
    }
}
