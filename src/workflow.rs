//! Two-phase description flow: preview a model draft, then confirm the text
//! a human settled on.
//!
//! `preview` never writes to the catalog. `confirm` stores whatever text it is
//! given (edited or not) with source `llm`.

use crate::catalog::{CatalogStore, DescriptionSource};
use crate::describe::{DescriptionContext, DescriptionGenerator, PropertySample};
use crate::error::{InsightError, Result};
use crate::llm::LanguageModel;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Child properties included when describing an event.
pub const MAX_CONTEXT_PROPERTIES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Event,
    Property,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Event => f.write_str("event"),
            TargetKind::Property => f.write_str("property"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeTarget {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(deserialize_with = "lenient_id")]
    pub id: i64,
}

/// Accept ids as JSON numbers or numeric strings (`"5"`), as form-driven
/// clients send them.
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(raw) => raw
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid id: {:?}", raw))),
    }
}

impl DescribeTarget {
    pub fn event(id: i64) -> Self {
        Self {
            kind: TargetKind::Event,
            id,
        }
    }

    pub fn property(id: i64) -> Self {
        Self {
            kind: TargetKind::Property,
            id,
        }
    }
}

/// A draft and the exact context the model was given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub target: DescribeTarget,
    pub description: String,
    pub context: DescriptionContext,
}

pub struct DescriptionWorkflow {
    catalog: Arc<CatalogStore>,
    generator: DescriptionGenerator,
}

impl DescriptionWorkflow {
    pub fn new(catalog: Arc<CatalogStore>, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            catalog,
            generator: DescriptionGenerator::new(llm),
        }
    }

    pub fn build_context(&self, target: DescribeTarget) -> Result<DescriptionContext> {
        match target.kind {
            TargetKind::Event => {
                let event = self
                    .catalog
                    .get_event(target.id)?
                    .ok_or_else(|| InsightError::not_found("Event", target.id))?;
                let properties = self
                    .catalog
                    .get_properties(event.id)?
                    .into_iter()
                    .take(MAX_CONTEXT_PROPERTIES)
                    .map(|p| PropertySample {
                        name: p.name,
                        sample_values: p.sample_values,
                    })
                    .collect();
                Ok(DescriptionContext::Event {
                    name: event.name,
                    properties,
                })
            }
            TargetKind::Property => {
                let property = self
                    .catalog
                    .get_property(target.id)?
                    .ok_or_else(|| InsightError::not_found("Property", target.id))?;
                let event_name = self.catalog.get_event(property.event_id)?.map(|e| e.name);
                Ok(DescriptionContext::Property {
                    name: property.name,
                    event_name,
                    sample_values: property.sample_values,
                    data_type: property.data_type,
                })
            }
        }
    }

    /// Draft a description. Persists nothing.
    pub async fn preview(&self, target: DescribeTarget) -> Result<Preview> {
        let context = self.build_context(target)?;
        info!(kind = %target.kind, name = context.name(), "Generating description");
        let draft = self.generator.generate(&context).await?;
        Ok(Preview {
            target,
            description: draft.description,
            context,
        })
    }

    /// Store `description` verbatim as a model-authored description.
    pub fn confirm(&self, target: DescribeTarget, description: &str) -> Result<()> {
        match target.kind {
            TargetKind::Event => {
                self.catalog
                    .set_event_description(target.id, description, DescriptionSource::Llm)?
            }
            TargetKind::Property => {
                self.catalog
                    .set_property_description(target.id, description, DescriptionSource::Llm)?
            }
        }
        info!(kind = %target.kind, id = target.id, "Saved LLM description");
        Ok(())
    }
}

/// One human's pass through the preview/confirm flow.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DescriptionSession {
    #[default]
    Idle,
    Previewing {
        target: DescribeTarget,
    },
    Previewed {
        preview: Preview,
    },
    Saved {
        target: DescribeTarget,
        description: String,
    },
}

impl DescriptionSession {
    pub fn new() -> Self {
        DescriptionSession::Idle
    }

    /// Current draft, if one is waiting for confirmation.
    pub fn draft(&self) -> Option<&Preview> {
        match self {
            DescriptionSession::Previewed { preview } => Some(preview),
            _ => None,
        }
    }

    /// Request a draft. Any earlier draft is dropped; a failed generation
    /// leaves the session idle.
    pub async fn preview(
        &mut self,
        workflow: &DescriptionWorkflow,
        target: DescribeTarget,
    ) -> Result<Preview> {
        if let DescriptionSession::Previewing { .. } = self {
            return Err(InsightError::Validation(
                "a preview is already in progress".to_string(),
            ));
        }

        *self = DescriptionSession::Previewing { target };
        match workflow.preview(target).await {
            Ok(preview) => {
                *self = DescriptionSession::Previewed {
                    preview: preview.clone(),
                };
                Ok(preview)
            }
            Err(e) => {
                *self = DescriptionSession::Idle;
                Err(e)
            }
        }
    }

    /// Persist `description` (the draft, or an edited version of it).
    pub fn confirm(&mut self, workflow: &DescriptionWorkflow, description: &str) -> Result<()> {
        let target = match self {
            DescriptionSession::Previewed { preview } => preview.target,
            _ => {
                return Err(InsightError::Validation(
                    "no previewed description to confirm".to_string(),
                ))
            }
        };

        workflow.confirm(target, description)?;
        *self = DescriptionSession::Saved {
            target,
            description: description.to_string(),
        };
        Ok(())
    }

    /// Throw the draft away without saving.
    pub fn discard(&mut self) {
        *self = DescriptionSession::Idle;
    }
}
