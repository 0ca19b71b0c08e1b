//! Draft descriptions for catalog events and properties.
//!
//! Nothing here touches the catalog; persisting a draft is the workflow's job.

use crate::catalog::DataType;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::trace::DebugTrace;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const DESCRIPTION_PROMPT: &str = r#"You are a data documentation expert. Generate a clear, concise description for an analytics event or property based on the context provided.

Guidelines:
- Keep descriptions brief (1-2 sentences)
- Focus on WHAT the event/property represents and WHEN it's triggered
- Use plain language that a non-technical person can understand
- If sample values are provided, use them to infer meaning
- Do not include technical implementation details
- Do not start with "This event" or "This property" - be direct"#;

const MAX_TOKENS: u32 = 150;
const EVENT_PROPERTIES_WITH_SAMPLES: usize = 5;
const EVENT_SAMPLES_PER_PROPERTY: usize = 5;
const PROPERTY_SAMPLES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySample {
    pub name: String,
    #[serde(rename = "sampleValues")]
    pub sample_values: Vec<Value>,
}

/// What the model sees when drafting a description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DescriptionContext {
    Event {
        name: String,
        properties: Vec<PropertySample>,
    },
    Property {
        name: String,
        #[serde(rename = "eventName")]
        event_name: Option<String>,
        #[serde(rename = "sampleValues")]
        sample_values: Vec<Value>,
        #[serde(rename = "dataType")]
        data_type: Option<DataType>,
    },
}

impl DescriptionContext {
    pub fn name(&self) -> &str {
        match self {
            DescriptionContext::Event { name, .. } | DescriptionContext::Property { name, .. } => {
                name
            }
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_values(values: &[Value], limit: usize) -> String {
    values.iter().take(limit).map(render_value).join(", ")
}

/// User message describing `context`.
pub fn render_context(context: &DescriptionContext) -> String {
    match context {
        DescriptionContext::Event { name, properties } => {
            let mut content = format!("Event name: \"{}\"", name);
            if !properties.is_empty() {
                content.push_str(&format!(
                    "\nProperties: {}",
                    properties.iter().map(|p| p.name.as_str()).join(", ")
                ));
                let with_values: Vec<&PropertySample> = properties
                    .iter()
                    .filter(|p| !p.sample_values.is_empty())
                    .take(EVENT_PROPERTIES_WITH_SAMPLES)
                    .collect();
                if !with_values.is_empty() {
                    content.push_str("\nSample values:");
                    for property in with_values {
                        content.push_str(&format!(
                            "\n  {}: {}",
                            property.name,
                            render_values(&property.sample_values, EVENT_SAMPLES_PER_PROPERTY)
                        ));
                    }
                }
            }
            content
        }
        DescriptionContext::Property {
            name,
            event_name,
            sample_values,
            data_type,
        } => {
            let mut content = format!("Property name: \"{}\"", name);
            if let Some(event_name) = event_name {
                content.push_str(&format!("\nOn event: \"{}\"", event_name));
            }
            if let Some(data_type) = data_type {
                content.push_str(&format!("\nData type: {}", data_type));
            }
            if !sample_values.is_empty() {
                content.push_str(&format!(
                    "\nSample values: {}",
                    render_values(sample_values, PROPERTY_SAMPLES)
                ));
            }
            content
        }
    }
}

#[derive(Debug, Clone)]
pub struct Draft {
    pub description: String,
    pub trace: DebugTrace,
}

pub struct DescriptionGenerator {
    llm: Arc<dyn LanguageModel>,
}

impl DescriptionGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    pub async fn generate(&self, context: &DescriptionContext) -> Result<Draft> {
        let messages = vec![
            ChatMessage::system(DESCRIPTION_PROMPT),
            ChatMessage::user(render_context(context)),
        ];
        let request =
            CompletionRequest::new(self.llm.model(), messages, 0.3).max_tokens(MAX_TOKENS);

        let completion = self.llm.complete(&request).await?;
        let description = completion.content.trim().to_string();

        Ok(Draft {
            trace: completion.trace(&request, Value::String(description.clone())),
            description,
        })
    }
}
