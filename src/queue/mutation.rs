// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutations and the queue entries that carry them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The record a mutation touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef {
    pub collection: String,
    pub record_id: String,
}

impl RecordRef {
    pub fn new(collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            record_id: record_id.into(),
        }
    }
}

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.record_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationAction {
    /// Merge `payload` into the target record (or create it)
    Upsert,
    Delete,
}

/// A write bound for the remote API.
///
/// `operation_type` is the domain verb (`updateMark`, `saveComment`, ...);
/// the layer never interprets it, only forwards it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: String,
    pub operation_type: String,
    #[serde(default)]
    pub target: Option<RecordRef>,
    pub action: MutationAction,
    #[serde(default)]
    pub payload: Value,
}

impl Mutation {
    /// Merge `payload` into `collection/record_id`.
    pub fn upsert(
        operation_type: impl Into<String>,
        collection: impl Into<String>,
        record_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            target: Some(RecordRef::new(collection, record_id)),
            action: MutationAction::Upsert,
            payload,
        }
    }

    pub fn delete(
        operation_type: impl Into<String>,
        collection: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            target: Some(RecordRef::new(collection, record_id)),
            action: MutationAction::Delete,
            payload: Value::Null,
        }
    }

    /// A mutation with no cached record behind it (e.g. "send message").
    pub fn untargeted(operation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type: operation_type.into(),
            target: None,
            action: MutationAction::Upsert,
            payload,
        }
    }

    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.collection.as_str())
    }

    /// Apply this mutation to a collection's records, matching on `id_field`.
    ///
    /// Upserts shallow-merge object payloads into the existing record, or
    /// append a new record carrying the id. Returns the index of the touched
    /// record (`None` for deletes and untargeted mutations).
    pub fn apply_to(&self, records: &mut Vec<Value>, id_field: &str) -> Option<usize> {
        let target = self.target.as_ref()?;
        let pos = records
            .iter()
            .position(|r| record_id_of(r, id_field).as_deref() == Some(target.record_id.as_str()));

        match self.action {
            MutationAction::Delete => {
                if let Some(pos) = pos {
                    records.remove(pos);
                }
                None
            }
            MutationAction::Upsert => match pos {
                Some(pos) => {
                    merge_into(&mut records[pos], &self.payload);
                    Some(pos)
                }
                None => {
                    let mut record = Value::Object(Default::default());
                    merge_into(&mut record, &self.payload);
                    if let Value::Object(map) = &mut record {
                        map.insert(id_field.to_string(), Value::String(target.record_id.clone()));
                    }
                    records.push(record);
                    Some(records.len() - 1)
                }
            },
        }
    }
}

/// A record's id as a string, whether stored as string or number.
pub fn record_id_of(record: &Value, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn merge_into(record: &mut Value, payload: &Value) {
    match (record, payload) {
        (Value::Object(existing), Value::Object(patch)) => {
            for (k, v) in patch {
                existing.insert(k.clone(), v.clone());
            }
        }
        (_, Value::Null) => {}
        (record, payload) => *record = payload.clone(),
    }
}

/// A mutation waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub operation: Mutation,
    /// Epoch millis
    pub enqueued_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(operation: Mutation, enqueued_at: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            enqueued_at,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Milliseconds since enqueue (never negative).
    #[must_use]
    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.enqueued_at).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constructors_set_target_and_action() {
        let m = Mutation::upsert("updateMark", "marks", "m1", json!({"score": 7}));
        assert_eq!(m.target, Some(RecordRef::new("marks", "m1")));
        assert_eq!(m.action, MutationAction::Upsert);
        assert_eq!(m.collection(), Some("marks"));

        let d = Mutation::delete("deleteComment", "comments", "c1");
        assert_eq!(d.action, MutationAction::Delete);
        assert_eq!(d.payload, Value::Null);

        let u = Mutation::untargeted("sendMessage", json!({"body": "hi"}));
        assert!(u.target.is_none());
        assert_eq!(u.collection(), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Mutation::untargeted("x", Value::Null);
        let b = Mutation::untargeted("x", Value::Null);
        assert_ne!(a.id, b.id);
        assert_ne!(QueueItem::new(a.clone(), 0).id, QueueItem::new(a, 0).id);
    }

    #[test]
    fn test_queue_item_wire_names() {
        let item = QueueItem::new(Mutation::delete("del", "c", "r"), 5);
        let v = serde_json::to_value(&item).unwrap();
        assert_eq!(v["enqueuedAt"], json!(5));
        assert_eq!(v["retryCount"], json!(0));
        assert_eq!(v["operation"]["operationType"], json!("del"));
        assert_eq!(v["operation"]["target"]["recordId"], json!("r"));
        assert_eq!(v["operation"]["action"], json!("delete"));
    }

    #[test]
    fn test_age_is_never_negative() {
        let item = QueueItem::new(Mutation::untargeted("x", Value::Null), 1_000);
        assert_eq!(item.age_millis(1_500), 500);
        assert_eq!(item.age_millis(900), 0);
    }

    #[test]
    fn test_apply_upsert_merges_existing_record() {
        let mut records = vec![json!({"id": "m1", "score": 1, "note": "x"}), json!({"id": 2, "score": 5})];

        let pos = Mutation::upsert("updateMark", "marks", "m1", json!({"score": 9})).apply_to(&mut records, "id");
        assert_eq!(pos, Some(0));
        assert_eq!(records[0], json!({"id": "m1", "score": 9, "note": "x"}));

        // Numeric ids match their string form
        Mutation::upsert("updateMark", "marks", "2", json!({"score": 6})).apply_to(&mut records, "id");
        assert_eq!(records[1]["score"], json!(6));
    }

    #[test]
    fn test_apply_upsert_creates_missing_record() {
        let mut records = Vec::new();
        let pos = Mutation::upsert("addMark", "marks", "new", json!({"score": 3})).apply_to(&mut records, "id");
        assert_eq!(pos, Some(0));
        assert_eq!(records, vec![json!({"id": "new", "score": 3})]);
    }

    #[test]
    fn test_apply_delete_and_untargeted() {
        let mut records = vec![json!({"id": "a"}), json!({"id": "b"})];
        assert_eq!(Mutation::delete("del", "c", "a").apply_to(&mut records, "id"), None);
        assert_eq!(records, vec![json!({"id": "b"})]);

        assert_eq!(Mutation::untargeted("ping", json!({})).apply_to(&mut records, "id"), None);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_record_ref_display() {
        assert_eq!(RecordRef::new("marks", "42").to_string(), "marks/42");
    }
}
