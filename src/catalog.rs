//! Schema Catalog - persistent event/property metadata
//!
//! Events and their properties are discovered from Mixpanel and upserted here.
//! Descriptions are written either by hand (`manual`) or after a confirmed
//! model-generated draft (`llm`).
//!
//! Architecture: a single SQLite connection behind a mutex. Every write is one
//! statement, so upserts are atomic (insert XOR refresh).

use crate::error::{InsightError, Result};
use chrono::Utc;
use itertools::Itertools;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Upper bound on stored sample values per property.
pub const MAX_SAMPLE_VALUES: usize = 20;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT UNIQUE NOT NULL,
        description TEXT,
        description_source TEXT NOT NULL DEFAULT 'none',
        event_count INTEGER,
        discovered_at TEXT,
        updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS properties (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        data_type TEXT,
        description TEXT,
        description_source TEXT NOT NULL DEFAULT 'none',
        sample_values TEXT,
        value_count INTEGER,
        discovered_at TEXT,
        updated_at TEXT,
        UNIQUE(event_id, name)
    );

    CREATE INDEX IF NOT EXISTS idx_properties_event ON properties(event_id);
"#;

/// Who wrote the current description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionSource {
    #[default]
    None,
    Manual,
    Llm,
}

impl DescriptionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionSource::None => "none",
            DescriptionSource::Manual => "manual",
            DescriptionSource::Llm => "llm",
        }
    }
}

impl FromStr for DescriptionSource {
    type Err = InsightError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(DescriptionSource::None),
            "manual" => Ok(DescriptionSource::Manual),
            "llm" => Ok(DescriptionSource::Llm),
            other => Err(InsightError::Validation(format!(
                "unknown description source: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DescriptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data type inferred from a property's sample values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    List,
    Object,
    Unknown,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::List => "list",
            DataType::Object => "object",
            DataType::Unknown => "unknown",
        }
    }

    /// Infer the type from the runtime shape of one sample value.
    pub fn infer(sample: &serde_json::Value) -> Self {
        match sample {
            serde_json::Value::Number(_) => DataType::Number,
            serde_json::Value::Bool(_) => DataType::Boolean,
            serde_json::Value::Array(_) => DataType::List,
            serde_json::Value::Object(_) => DataType::Object,
            _ => DataType::String,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "string" => DataType::String,
            "number" => DataType::Number,
            "boolean" => DataType::Boolean,
            "list" => DataType::List,
            "object" => DataType::Object,
            _ => DataType::Unknown,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    /// Exact Mixpanel event name; unique in the catalog.
    pub name: String,
    pub description: Option<String>,
    pub description_source: DescriptionSource,
    /// Volume reported by Mixpanel's top-events listing at last discovery.
    pub event_count: Option<i64>,
    pub discovered_at: Option<String>,
    pub updated_at: Option<String>,
}

/// An event annotated with the number of catalogued properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    #[serde(flatten)]
    pub event: Event,
    pub property_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    /// Inferred from the first sample value; unset until values are discovered.
    pub data_type: Option<DataType>,
    pub description: Option<String>,
    pub description_source: DescriptionSource,
    /// At most [`MAX_SAMPLE_VALUES`] entries.
    pub sample_values: Vec<serde_json::Value>,
    /// How often the property appeared on its event, per Mixpanel.
    pub value_count: Option<i64>,
    pub discovered_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyExport {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: Option<DataType>,
    pub description: Option<String>,
    #[serde(rename = "sampleValues")]
    pub sample_values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventExport {
    pub name: String,
    pub description: Option<String>,
    pub properties: Vec<PropertyExport>,
}

const EVENT_COLUMNS: &str =
    "e.id, e.name, e.description, e.description_source, e.event_count, e.discovered_at, e.updated_at";

const PROPERTY_COLUMNS: &str = "id, event_id, name, data_type, description, description_source, \
     sample_values, value_count, discovered_at, updated_at";

fn source_from_row(raw: Option<String>) -> DescriptionSource {
    raw.and_then(|s| s.parse().ok()).unwrap_or_default()
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        description_source: source_from_row(row.get(3)?),
        event_count: row.get(4)?,
        discovered_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn property_from_row(row: &Row<'_>) -> rusqlite::Result<Property> {
    let data_type: Option<String> = row.get(3)?;
    let samples: Option<String> = row.get(6)?;
    Ok(Property {
        id: row.get(0)?,
        event_id: row.get(1)?,
        name: row.get(2)?,
        data_type: data_type.as_deref().map(DataType::parse),
        description: row.get(4)?,
        description_source: source_from_row(row.get(5)?),
        // A corrupt column reads as empty rather than failing the whole listing.
        sample_values: samples
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
        value_count: row.get(7)?,
        discovered_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Catalog Store - events and their properties in SQLite
pub struct CatalogStore {
    db: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (or create) a catalog database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Connection::open(path)?;
        let store = Self::from_connection(db)?;
        info!(path = %path.display(), "Opened schema catalog");
        Ok(store)
    }

    /// Catalog held entirely in memory; used by tests and one-off runs.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(db: Connection) -> Result<Self> {
        db.pragma_update(None, "foreign_keys", "ON")?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    // Every write is a single statement, so a poisoned guard still holds a
    // consistent connection.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// All events with their property counts, most used first.
    pub fn list_events(&self) -> Result<Vec<EventSummary>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            r#"
            SELECT {}, COUNT(p.id) AS property_count
            FROM events e
            LEFT JOIN properties p ON p.event_id = e.id
            GROUP BY e.id
            ORDER BY e.event_count IS NULL, e.event_count DESC, e.name
            "#,
            EVENT_COLUMNS
        ))?;

        let events = stmt
            .query_map([], |row| {
                Ok(EventSummary {
                    event: event_from_row(row)?,
                    property_count: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn get_event(&self, id: i64) -> Result<Option<Event>> {
        let db = self.conn();
        let event = db
            .query_row(
                &format!("SELECT {} FROM events e WHERE e.id = ?1", EVENT_COLUMNS),
                params![id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    pub fn get_event_by_name(&self, name: &str) -> Result<Option<Event>> {
        let db = self.conn();
        let event = db
            .query_row(
                &format!("SELECT {} FROM events e WHERE e.name = ?1", EVENT_COLUMNS),
                params![name],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Insert an event, or refresh its count if the name already exists.
    /// Returns the row id either way.
    pub fn upsert_event(&self, name: &str, event_count: Option<i64>) -> Result<i64> {
        let db = self.conn();
        let stamp = now();
        let id = db.query_row(
            r#"
            INSERT INTO events (name, event_count, discovered_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(name) DO UPDATE SET
                event_count = excluded.event_count,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
            params![name, event_count, stamp],
            |row| row.get(0),
        )?;
        debug!(event = name, id, "Upserted event");
        Ok(id)
    }

    pub fn set_event_description(
        &self,
        id: i64,
        description: &str,
        source: DescriptionSource,
    ) -> Result<()> {
        let db = self.conn();
        let updated = db.execute(
            r#"
            UPDATE events
            SET description = ?1, description_source = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![description, source.as_str(), now(), id],
        )?;
        if updated == 0 {
            return Err(InsightError::not_found("Event", id));
        }
        Ok(())
    }

    /// Delete an event; its properties go with it.
    pub fn delete_event(&self, id: i64) -> Result<()> {
        let db = self.conn();
        let removed = db.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(InsightError::not_found("Event", id));
        }
        info!(id, "Deleted event");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// Properties of one event, most populated first.
    pub fn get_properties(&self, event_id: i64) -> Result<Vec<Property>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            r#"
            SELECT {}
            FROM properties
            WHERE event_id = ?1
            ORDER BY value_count IS NULL, value_count DESC, name
            "#,
            PROPERTY_COLUMNS
        ))?;
        let properties = stmt
            .query_map(params![event_id], property_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(properties)
    }

    pub fn get_property(&self, id: i64) -> Result<Option<Property>> {
        let db = self.conn();
        let property = db
            .query_row(
                &format!("SELECT {} FROM properties WHERE id = ?1", PROPERTY_COLUMNS),
                params![id],
                property_from_row,
            )
            .optional()?;
        Ok(property)
    }

    /// Insert a property under `event_id`, or refresh its count.
    pub fn upsert_property(&self, event_id: i64, name: &str, value_count: Option<i64>) -> Result<i64> {
        let db = self.conn();
        let stamp = now();
        let id = db
            .query_row(
                r#"
                INSERT INTO properties (event_id, name, value_count, discovered_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(event_id, name) DO UPDATE SET
                    value_count = excluded.value_count,
                    updated_at = excluded.updated_at
                RETURNING id
                "#,
                params![event_id, name, value_count, stamp],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    InsightError::not_found("Event", event_id)
                }
                other => other.into(),
            })?;
        Ok(id)
    }

    pub fn set_property_description(
        &self,
        id: i64,
        description: &str,
        source: DescriptionSource,
    ) -> Result<()> {
        let db = self.conn();
        let updated = db.execute(
            r#"
            UPDATE properties
            SET description = ?1, description_source = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![description, source.as_str(), now(), id],
        )?;
        if updated == 0 {
            return Err(InsightError::not_found("Property", id));
        }
        Ok(())
    }

    /// Store sample values (truncated to [`MAX_SAMPLE_VALUES`]) and the
    /// inferred data type.
    pub fn set_property_samples(
        &self,
        id: i64,
        values: &[serde_json::Value],
        data_type: DataType,
    ) -> Result<()> {
        let bounded = &values[..values.len().min(MAX_SAMPLE_VALUES)];
        let serialized = serde_json::to_string(bounded)?;

        let db = self.conn();
        let updated = db.execute(
            r#"
            UPDATE properties
            SET sample_values = ?1, data_type = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![serialized, data_type.as_str(), now(), id],
        )?;
        if updated == 0 {
            return Err(InsightError::not_found("Property", id));
        }
        Ok(())
    }

    pub fn delete_property(&self, id: i64) -> Result<()> {
        let db = self.conn();
        let removed = db.execute("DELETE FROM properties WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(InsightError::not_found("Property", id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    /// Every event with its properties nested.
    pub fn export_full(&self) -> Result<Vec<EventExport>> {
        let mut exported = Vec::new();
        for summary in self.list_events()? {
            let properties = self
                .get_properties(summary.event.id)?
                .into_iter()
                .map(|p| PropertyExport {
                    name: p.name,
                    data_type: p.data_type,
                    description: p.description,
                    sample_values: p.sample_values,
                })
                .collect();
            exported.push(EventExport {
                name: summary.event.name,
                description: summary.event.description,
                properties,
            });
        }
        Ok(exported)
    }

    /// One line per event, sized for inclusion in a prompt:
    ///
    /// ```text
    /// - Signup - User created an account
    ///     Properties: plan, referrer
    /// ```
    pub fn export_compact(&self) -> Result<String> {
        let mut lines = Vec::new();
        for summary in self.list_events()? {
            let event = summary.event;
            let mut line = format!("- {}", event.name);
            if let Some(description) = event.description.as_deref().filter(|d| !d.is_empty()) {
                line.push_str(&format!(" - {}", description));
            }
            let names = self.get_properties(event.id)?.into_iter().map(|p| p.name).join(", ");
            if !names.is_empty() {
                line.push_str(&format!("\n    Properties: {}", names));
            }
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_event_is_idempotent_by_name() {
        let store = CatalogStore::in_memory().unwrap();
        let first = store.upsert_event("Signup", Some(10)).unwrap();
        let second = store.upsert_event("Signup", Some(25)).unwrap();

        assert_eq!(first, second);
        let events = store.list_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.event_count, Some(25));
        assert!(events[0].event.updated_at >= events[0].event.discovered_at);
    }

    #[test]
    fn test_list_events_orders_by_usage_then_name() {
        let store = CatalogStore::in_memory().unwrap();
        store.upsert_event("Zeta", Some(5)).unwrap();
        store.upsert_event("Alpha", Some(5)).unwrap();
        store.upsert_event("Big", Some(100)).unwrap();
        store.upsert_event("Unknown", None).unwrap();

        let names: Vec<String> = store
            .list_events()
            .unwrap()
            .into_iter()
            .map(|e| e.event.name)
            .collect();
        assert_eq!(names, vec!["Big", "Alpha", "Zeta", "Unknown"]);
    }

    #[test]
    fn test_property_count_annotation() {
        let store = CatalogStore::in_memory().unwrap();
        let id = store.upsert_event("Purchase", Some(3)).unwrap();
        store.upsert_property(id, "amount", Some(3)).unwrap();
        store.upsert_property(id, "currency", Some(3)).unwrap();
        store.upsert_property(id, "amount", Some(4)).unwrap();

        let events = store.list_events().unwrap();
        assert_eq!(events[0].property_count, 2);
    }

    #[test]
    fn test_properties_order_by_value_count_then_name() {
        let store = CatalogStore::in_memory().unwrap();
        let id = store.upsert_event("Purchase", None).unwrap();
        store.upsert_property(id, "b", Some(1)).unwrap();
        store.upsert_property(id, "a", Some(1)).unwrap();
        store.upsert_property(id, "c", Some(9)).unwrap();

        let names: Vec<String> = store
            .get_properties(id)
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_delete_event_cascades_to_properties() {
        let store = CatalogStore::in_memory().unwrap();
        let id = store.upsert_event("Purchase", Some(1)).unwrap();
        for name in ["amount", "currency", "coupon"] {
            store.upsert_property(id, name, None).unwrap();
        }
        assert_eq!(store.get_properties(id).unwrap().len(), 3);

        store.delete_event(id).unwrap();
        assert!(store.get_event(id).unwrap().is_none());
        assert!(store.get_properties(id).unwrap().is_empty());
    }

    #[test]
    fn test_description_source_recorded() {
        let store = CatalogStore::in_memory().unwrap();
        let id = store.upsert_event("Signup", None).unwrap();
        assert_eq!(
            store.get_event(id).unwrap().unwrap().description_source,
            DescriptionSource::None
        );

        store
            .set_event_description(id, "User created an account", DescriptionSource::Manual)
            .unwrap();
        let event = store.get_event(id).unwrap().unwrap();
        assert_eq!(event.description.as_deref(), Some("User created an account"));
        assert_eq!(event.description_source, DescriptionSource::Manual);
    }

    #[test]
    fn test_mutations_on_unknown_ids_are_not_found() {
        let store = CatalogStore::in_memory().unwrap();
        assert!(store
            .set_event_description(42, "x", DescriptionSource::Manual)
            .unwrap_err()
            .is_not_found());
        assert!(store.delete_event(42).unwrap_err().is_not_found());
        assert!(store
            .set_property_samples(42, &[], DataType::String)
            .unwrap_err()
            .is_not_found());
        assert!(store.upsert_property(42, "orphan", None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_samples_are_bounded_and_round_trip() {
        let store = CatalogStore::in_memory().unwrap();
        let event_id = store.upsert_event("Purchase", None).unwrap();
        let prop_id = store.upsert_property(event_id, "amount", None).unwrap();

        let values: Vec<_> = (0..50).map(|i| json!(i)).collect();
        store.set_property_samples(prop_id, &values, DataType::Number).unwrap();

        let property = store.get_property(prop_id).unwrap().unwrap();
        assert_eq!(property.sample_values.len(), MAX_SAMPLE_VALUES);
        assert_eq!(property.sample_values[0], json!(0));
        assert_eq!(property.data_type, Some(DataType::Number));
    }

    #[test]
    fn test_compact_export_format() {
        let store = CatalogStore::in_memory().unwrap();
        let signup = store.upsert_event("Signup", Some(10)).unwrap();
        store.upsert_event("Logout", Some(1)).unwrap();
        store
            .set_event_description(signup, "User created an account", DescriptionSource::Llm)
            .unwrap();
        store.upsert_property(signup, "plan", Some(5)).unwrap();
        store.upsert_property(signup, "referrer", Some(2)).unwrap();

        assert_eq!(
            store.export_compact().unwrap(),
            "- Signup - User created an account\n    Properties: plan, referrer\n- Logout"
        );
    }

    #[test]
    fn test_full_export_nests_properties() {
        let store = CatalogStore::in_memory().unwrap();
        let id = store.upsert_event("Signup", Some(10)).unwrap();
        let prop = store.upsert_property(id, "plan", Some(5)).unwrap();
        store
            .set_property_samples(prop, &[json!("free"), json!("pro")], DataType::String)
            .unwrap();

        let export = store.export_full().unwrap();
        assert_eq!(export.len(), 1);
        assert_eq!(export[0].properties[0].sample_values, vec![json!("free"), json!("pro")]);

        let value = serde_json::to_value(&export).unwrap();
        assert_eq!(value[0]["properties"][0]["type"], "string");
        assert_eq!(value[0]["properties"][0]["sampleValues"][1], "pro");
    }

    #[test]
    fn test_file_backed_catalog_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("schema.db");

        {
            let store = CatalogStore::open(&path).unwrap();
            store.upsert_event("Signup", Some(1)).unwrap();
        }

        let reopened = CatalogStore::open(&path).unwrap();
        assert!(reopened.get_event_by_name("Signup").unwrap().is_some());
    }

    #[test]
    fn test_poisoned_lock_still_serves_requests() {
        let store = std::sync::Arc::new(CatalogStore::in_memory().unwrap());
        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.db.lock().unwrap();
            panic!("writer crashed while holding the connection");
        })
        .join();
        assert!(store.db.is_poisoned());

        let id = store.upsert_event("Signup", Some(1)).unwrap();
        assert_eq!(store.get_event(id).unwrap().unwrap().name, "Signup");
    }

    #[test]
    fn test_infer_data_type() {
        assert_eq!(DataType::infer(&json!(3.5)), DataType::Number);
        assert_eq!(DataType::infer(&json!(true)), DataType::Boolean);
        assert_eq!(DataType::infer(&json!(["a"])), DataType::List);
        assert_eq!(DataType::infer(&json!({"k": 1})), DataType::Object);
        assert_eq!(DataType::infer(&json!("x")), DataType::String);
        assert_eq!(DataType::infer(&json!(null)), DataType::String);
    }
}
