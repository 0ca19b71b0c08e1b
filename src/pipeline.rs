//! Question → interpretation → Mixpanel query → summary.
//!
//! The three stages run strictly in sequence. Any stage failing aborts the
//! whole run with [`InsightError::QueryFailed`]; nothing partial is returned.

use crate::analytics::{
    AnalyticsApi, AnalyticsResponse, FunnelQuery, QueryType, RetentionQuery, SegmentationQuery,
};
use crate::catalog::CatalogStore;
use crate::error::{InsightError, Result};
use crate::interpret::{QuerySpec, Interpreter};
use crate::llm::LanguageModel;
use crate::summarize::Summarizer;
use crate::trace::DebugTrace;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const MAX_QUESTION_CHARS: usize = 500;

/// Every trace from one run, plus the LLM token total.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDebug {
    pub interpretation: DebugTrace,
    pub analytics: DebugTrace,
    pub summarization: DebugTrace,
    pub total_tokens: u32,
}

impl PipelineDebug {
    fn new(interpretation: DebugTrace, analytics: DebugTrace, summarization: DebugTrace) -> Self {
        let total_tokens = [&interpretation, &analytics, &summarization]
            .iter()
            .map(|trace| trace.total_tokens())
            .sum();
        Self {
            interpretation,
            analytics,
            summarization,
            total_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    /// Random id used to correlate log lines for one run.
    pub request_id: String,
    /// The trimmed question that was answered.
    pub question: String,
    /// Type actually dispatched, after any fallback to segmentation.
    pub query_type: QueryType,
    pub query: QuerySpec,
    pub summary: String,
    /// Raw Mixpanel JSON, unmodified.
    pub data: Value,
    /// Mixpanel UI link for the query type (filters are not carried over).
    #[serde(rename = "mixpanel_link")]
    pub analytics_link: String,
    pub debug: PipelineDebug,
}

/// Trim and bound-check a question.
pub fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(InsightError::Validation(
            "Missing required parameter: q".to_string(),
        ));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(InsightError::Validation(format!(
            "Question must be {} characters or less",
            MAX_QUESTION_CHARS
        )));
    }
    Ok(question)
}

fn stage_failed(stage: &'static str) -> impl FnOnce(InsightError) -> InsightError {
    move |source| {
        error!(stage, error = %source, "Query pipeline failed");
        InsightError::QueryFailed {
            stage,
            source: Box::new(source),
        }
    }
}

pub struct QueryPipeline {
    catalog: Arc<CatalogStore>,
    analytics: Arc<dyn AnalyticsApi>,
    interpreter: Interpreter,
    summarizer: Summarizer,
    today: Option<NaiveDate>,
}

impl QueryPipeline {
    pub fn new(
        catalog: Arc<CatalogStore>,
        analytics: Arc<dyn AnalyticsApi>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            catalog,
            analytics,
            interpreter: Interpreter::new(llm.clone()),
            summarizer: Summarizer::new(llm),
            today: None,
        }
    }

    /// Resolve relative dates against a fixed day instead of the clock.
    pub fn pinned_to(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub async fn run(&self, question: &str) -> Result<PipelineResult> {
        let question = validate_question(question)?;
        let request_id = Uuid::new_v4().to_string();
        info!(request_id = %request_id, question, "Processing question");

        let context = self.catalog_context();
        let interpretation = match self.today {
            Some(today) => self.interpreter.interpret_on(question, &context, today).await,
            None => self.interpreter.interpret(question, &context).await,
        }
        .map_err(stage_failed("interpretation"))?;

        let (query_type, response) = self
            .dispatch(&interpretation.spec)
            .await
            .map_err(stage_failed("analytics query"))?;

        let summary = self
            .summarizer
            .summarize(question, &response.data)
            .await
            .map_err(stage_failed("summarization"))?;

        let analytics_link = self.analytics.deep_link(query_type);
        let traces = PipelineDebug::new(interpretation.trace, response.trace, summary.trace);
        let total_tokens = traces.total_tokens;

        info!(
            request_id = %request_id,
            query_type = %query_type,
            total_tokens,
            "Question answered"
        );

        Ok(PipelineResult {
            request_id,
            question: question.to_string(),
            query_type,
            query: interpretation.spec,
            summary: summary.text,
            data: response.data,
            analytics_link,
            debug: traces,
        })
    }

    /// Exactly one Mixpanel call per spec. Unknown types go to segmentation
    /// with whatever params came back.
    async fn dispatch(&self, spec: &QuerySpec) -> Result<(QueryType, AnalyticsResponse)> {
        let query_type = spec.resolved_type();
        if !spec.is_recognized() {
            warn!(
                query_type = ?spec.query_type,
                "Unrecognized query type, falling back to segmentation"
            );
        }

        let response = match query_type {
            QueryType::Segmentation => {
                let query = SegmentationQuery::try_from(&spec.params)?;
                self.analytics.segmentation(&query).await?
            }
            QueryType::Retention => {
                let query = RetentionQuery::try_from(&spec.params)?;
                self.analytics.retention(&query).await?
            }
            QueryType::Funnels => {
                let query = FunnelQuery::try_from(&spec.params)?;
                self.analytics.funnel(&query).await?
            }
            QueryType::Events => self.analytics.list_events().await?,
        };
        Ok((query_type, response))
    }

    /// Compact catalog view for the interpretation prompt, read fresh on
    /// every call. An unreadable catalog means no context, not a failure.
    fn catalog_context(&self) -> String {
        match self.catalog.export_compact() {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "Catalog context unavailable");
                String::new()
            }
        }
    }
}
