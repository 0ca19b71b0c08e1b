//! Populate the schema catalog from Mixpanel.
//!
//! `discover_all` is the batch entry point: each event's property discovery
//! is isolated, so one failing event is recorded and the rest carry on.

use crate::analytics::{parse_top_events, AnalyticsApi};
use crate::catalog::{CatalogStore, DataType, Event, MAX_SAMPLE_VALUES};
use crate::error::{InsightError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesDiscovery {
    pub count: usize,
    pub event_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuesDiscovery {
    pub count: usize,
    pub values: Vec<Value>,
    pub data_type: DataType,
}

/// A per-event failure recorded during `discover_all`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryError {
    pub event: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullDiscovery {
    pub event_count: usize,
    pub property_count: usize,
    pub errors: Vec<DiscoveryError>,
}

pub struct Discovery {
    catalog: Arc<CatalogStore>,
    analytics: Arc<dyn AnalyticsApi>,
}

impl Discovery {
    pub fn new(catalog: Arc<CatalogStore>, analytics: Arc<dyn AnalyticsApi>) -> Self {
        Self { catalog, analytics }
    }

    /// Upsert Mixpanel's top events. Returns how many were seen.
    pub async fn discover_events(&self) -> Result<usize> {
        info!("Discovering events from Mixpanel");
        let response = self.analytics.list_events().await?;

        let events = parse_top_events(&response.data);
        for event in &events {
            self.catalog.upsert_event(&event.name, event.count)?;
        }

        info!(count = events.len(), "Discovered events");
        Ok(events.len())
    }

    pub async fn discover_properties(&self, event_id: i64) -> Result<PropertiesDiscovery> {
        let event = self
            .catalog
            .get_event(event_id)?
            .ok_or_else(|| InsightError::not_found("Event", event_id))?;

        let count = self.discover_properties_for(&event).await?;
        Ok(PropertiesDiscovery {
            count,
            event_name: event.name,
        })
    }

    async fn discover_properties_for(&self, event: &Event) -> Result<usize> {
        info!(event = %event.name, "Discovering properties");
        let properties = self.analytics.list_event_properties(&event.name).await?;

        for property in &properties {
            self.catalog
                .upsert_property(event.id, &property.name, property.count)?;
        }

        info!(event = %event.name, count = properties.len(), "Discovered properties");
        Ok(properties.len())
    }

    /// Fetch sample values for a property and infer its data type from the
    /// first one.
    pub async fn discover_values(&self, property_id: i64) -> Result<ValuesDiscovery> {
        let property = self
            .catalog
            .get_property(property_id)?
            .ok_or_else(|| InsightError::not_found("Property", property_id))?;
        let event = self
            .catalog
            .get_event(property.event_id)?
            .ok_or_else(|| InsightError::not_found("Event", property.event_id))?;

        info!(property = %property.name, event = %event.name, "Discovering values");
        let mut values = self
            .analytics
            .list_property_values(&event.name, &property.name)
            .await?;
        values.truncate(MAX_SAMPLE_VALUES);

        let data_type = values.first().map_or(DataType::String, DataType::infer);
        self.catalog
            .set_property_samples(property.id, &values, data_type)?;

        info!(property = %property.name, count = values.len(), data_type = %data_type, "Discovered values");
        Ok(ValuesDiscovery {
            count: values.len(),
            values,
            data_type,
        })
    }

    /// Events first, then properties for every catalogued event. Per-event
    /// failures are collected; only a failure to list events aborts.
    pub async fn discover_all(&self) -> Result<FullDiscovery> {
        info!("Starting full schema discovery");
        let event_count = self.discover_events().await?;

        let mut property_count = 0;
        let mut errors = Vec::new();

        for summary in self.catalog.list_events()? {
            let event = summary.event;
            match self.discover_properties_for(&event).await {
                Ok(count) => property_count += count,
                Err(e) => {
                    warn!(event = %event.name, error = %e, "Property discovery failed");
                    errors.push(DiscoveryError {
                        event: event.name,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            event_count,
            property_count,
            failures = errors.len(),
            "Full discovery complete"
        );
        Ok(FullDiscovery {
            event_count,
            property_count,
            errors,
        })
    }
}
