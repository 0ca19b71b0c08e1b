//! Natural-language question → typed Mixpanel query specification.

use crate::analytics::QueryType;
use crate::error::{InsightError, Result};
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::trace::DebugTrace;
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Length of the default trailing window, today included.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// The model's answer: a query type and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// Whatever the model put under `query_type`; not necessarily a string.
    #[serde(default)]
    pub query_type: Option<Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl QuerySpec {
    fn known_type(&self) -> Option<QueryType> {
        self.query_type.as_ref()?.as_str().and_then(QueryType::parse)
    }

    /// The query type to dispatch on. Anything unrecognized (or missing) is
    /// treated as segmentation.
    pub fn resolved_type(&self) -> QueryType {
        self.known_type().unwrap_or(QueryType::Segmentation)
    }

    pub fn is_recognized(&self) -> bool {
        self.known_type().is_some()
    }

    fn date_param(&self, key: &str) -> Option<NaiveDate> {
        let raw = self.params.get(key)?.as_str()?;
        NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
    }

    fn has_param(&self, key: &str) -> bool {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .map_or(false, |s| !s.trim().is_empty())
    }

    fn set_date(&mut self, key: &str, date: NaiveDate) {
        self.params
            .insert(key.to_string(), Value::String(date.format(DATE_FORMAT).to_string()));
    }

    /// Complete the trailing window for dated queries. Both ends missing
    /// gives the last seven days; one end missing is filled relative to the
    /// other.
    fn fill_default_window(&mut self, today: NaiveDate) {
        if !self.resolved_type().is_dated() {
            return;
        }
        let span = Duration::days(DEFAULT_WINDOW_DAYS - 1);
        match (self.has_param("from_date"), self.has_param("to_date")) {
            (true, true) => {}
            (false, false) => {
                self.set_date("from_date", today - span);
                self.set_date("to_date", today);
            }
            (true, false) => self.set_date("to_date", today),
            (false, true) => {
                let end = self.date_param("to_date").unwrap_or(today);
                self.set_date("from_date", end - span);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Interpretation {
    pub spec: QuerySpec,
    pub trace: DebugTrace,
}

/// System instruction for the interpretation call.
pub fn build_system_prompt(catalog_context: &str, today: NaiveDate) -> String {
    let schema_context = if catalog_context.trim().is_empty() {
        String::new()
    } else {
        format!(
            r#"
Available events in this Mixpanel project:
{}

IMPORTANT: Use the EXACT event names from the list above when they plausibly match the user's question.
"#,
            catalog_context
        )
    };

    format!(
        r#"You are a Mixpanel query assistant. Given a natural language question about analytics data, determine the appropriate Mixpanel query parameters.
{schema_context}
Return a JSON object with this structure:
{{
  "query_type": "segmentation" | "funnels" | "retention" | "events",
  "params": {{
    // For segmentation:
    "event": "event name",
    "from_date": "YYYY-MM-DD",
    "to_date": "YYYY-MM-DD",
    "on": "property to segment by (optional)",
    "where": "filter expression (optional)",
    "unit": "day" | "week" | "month"

    // For retention:
    "event": "return event name",
    "born_event": "initial event (optional)",
    "from_date": "YYYY-MM-DD",
    "to_date": "YYYY-MM-DD"

    // For funnels:
    "funnel_id": "saved funnel id",
    "from_date": "YYYY-MM-DD",
    "to_date": "YYYY-MM-DD"

    // For events:
    // No additional params needed - just lists top events
  }}
}}

Important:
- Default to the last {window} days (ending today) if no date range is specified
- Use "segmentation" for questions about event counts, trends, or breakdowns
- Use "retention" for questions about user retention or return rates
- Use "funnels" for questions about conversion through a saved funnel
- Use "events" for questions about what events exist
- Today's date is: {today}

Return ONLY valid JSON, no explanation."#,
        schema_context = schema_context,
        window = DEFAULT_WINDOW_DAYS,
        today = today.format(DATE_FORMAT),
    )
}

pub struct Interpreter {
    llm: Arc<dyn LanguageModel>,
}

impl Interpreter {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    pub async fn interpret(&self, question: &str, catalog_context: &str) -> Result<Interpretation> {
        self.interpret_on(question, catalog_context, Utc::now().date_naive())
            .await
    }

    /// Interpret with an explicit "today" for relative-date resolution.
    pub async fn interpret_on(
        &self,
        question: &str,
        catalog_context: &str,
        today: NaiveDate,
    ) -> Result<Interpretation> {
        let messages = vec![
            ChatMessage::system(build_system_prompt(catalog_context, today)),
            ChatMessage::user(question),
        ];
        let request = CompletionRequest::new(self.llm.model(), messages, 0.0).json_object();

        let completion = self.llm.complete(&request).await?;
        debug!(tokens = completion.usage.total, "Interpretation completed");

        let raw: Value = serde_json::from_str(completion.content.trim()).map_err(|e| {
            InsightError::Llm(format!(
                "Failed to parse interpretation: {}. Response: {}",
                e, completion.content
            ))
        })?;
        let mut spec: QuerySpec = serde_json::from_value(raw.clone()).map_err(|e| {
            InsightError::Llm(format!("Interpretation does not match query schema: {}", e))
        })?;
        spec.fill_default_window(today);

        info!(
            query_type = ?spec.query_type,
            params = %serde_json::Value::Object(spec.params.clone()),
            "Interpreted question"
        );

        Ok(Interpretation {
            trace: completion.trace(&request, raw),
            spec,
        })
    }
}
