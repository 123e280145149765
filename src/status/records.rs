use chrono::Utc;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::RwLock};

use super::normalize_name;

/// Last-write-wins store of per-process status records.
///
/// Used for update checks and symlink backup runs: each record is
/// `{ processName, checkedAt, ...fields }`, keyed by the normalized process
/// name. Callers always receive copies.
#[derive(Debug, Default)]
pub struct RecordCache {
    records: RwLock<HashMap<String, Map<String, Value>>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `fields` for `process_name`, replacing any previous record.
    ///
    /// Returns `None` without touching the cache when the name is blank or the
    /// payload is not a JSON object.
    pub fn set(&self, process_name: &str, fields: Value) -> Option<Value> {
        let key = normalize_name(process_name);
        let Value::Object(fields) = fields else {
            return None;
        };
        if key.is_empty() {
            return None;
        }

        let mut record = Map::new();
        record.insert(
            "processName".into(),
            Value::String(process_name.trim().to_string()),
        );
        record.insert("checkedAt".into(), Value::String(Utc::now().to_rfc3339()));
        for (field, value) in fields {
            if field != "processName" && field != "checkedAt" {
                record.insert(field, value);
            }
        }

        let stored = Value::Object(record.clone());
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, record);
        Some(stored)
    }

    /// Returns a copy of the record for `process_name`.
    pub fn get(&self, process_name: &str) -> Option<Value> {
        let key = normalize_name(process_name);
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned()
            .map(Value::Object)
    }

    /// Copies of every record, ordered by normalized name.
    pub fn all(&self) -> Vec<Value> {
        let guard = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut keys: Vec<&String> = guard.keys().collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| guard.get(key).cloned().map(Value::Object))
            .collect()
    }
}
