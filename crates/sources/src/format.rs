//! Chat rendering of change events.
//!
//! Everything here is driver-independent: adapters decode their wire format
//! into [`RowChange`], [`DocumentChange`] or [`TopicRecord`] and hand it to a
//! [`Formatter`].

use {
    herald_common::markdown::{bare_json_block, json_block},
    herald_config::RedactionConfig,
    herald_delta::{DEFAULT_MAX_FIELD_LEN, diff, redacted},
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

use crate::error::{Error, Result};

/// Notification payload emitted by the `notify_change()` trigger.
#[derive(Debug, Clone, Deserialize)]
struct ChangeNotification {
    action: String,
    #[serde(default)]
    table_name: String,
    #[serde(default)]
    database_name: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    new_data: Option<Value>,
    #[serde(default)]
    old_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    Insert(Value),
    Update { old: Value, new: Value },
    Delete(Value),
}

impl RowOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update { .. } => "update",
            Self::Delete(_) => "delete",
        }
    }
}

/// One row-level change reported by a relational database.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub database: Option<String>,
    pub table: String,
    pub op: RowOp,
}

impl RowChange {
    /// Decode a `pg_notify` payload. The action is matched case-insensitively
    /// (`TG_OP` arrives upper-case, the update/delete branches lower-case).
    pub fn parse(payload: &str) -> Result<Self> {
        let note: ChangeNotification = serde_json::from_str(payload)
            .map_err(|e| Error::malformed(format!("notification is not valid JSON: {e}")))?;
        if note.table_name.is_empty() {
            return Err(Error::malformed("notification has no table_name"));
        }

        let op = match note.action.to_ascii_lowercase().as_str() {
            "insert" => RowOp::Insert(
                note.data
                    .ok_or_else(|| Error::malformed("insert without data"))?,
            ),
            "update" => RowOp::Update {
                old: note.old_data.unwrap_or(Value::Null),
                new: note
                    .new_data
                    .ok_or_else(|| Error::malformed("update without new_data"))?,
            },
            "delete" => RowOp::Delete(
                note.data
                    .ok_or_else(|| Error::malformed("delete without data"))?,
            ),
            other => return Err(Error::malformed(format!("unknown action \"{other}\""))),
        };

        Ok(Self {
            database: note.database_name,
            table: note.table_name,
            op,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    Insert(Value),
    Update {
        id: Value,
        updated_fields: Map<String, Value>,
    },
}

/// One change-stream event from a document database.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub collection: String,
    pub op: DocumentOp,
}

/// A message-bus record as rendered in chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub value: Value,
}

impl TopicRecord {
    /// Build a record from a raw payload.
    ///
    /// JSON payloads are embedded as-is; other UTF-8 text becomes a string
    /// value and a missing payload becomes `null`. Binary payloads are rejected.
    pub fn decode(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: Option<&[u8]>,
    ) -> Result<Self> {
        let value = match payload {
            None => Value::Null,
            Some(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| Error::malformed(format!("payload is not UTF-8: {e}")))?;
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
            },
        };
        Ok(Self {
            topic: topic.into(),
            partition,
            offset,
            value,
        })
    }
}

/// Renders change events as MarkdownV2 chat text with redacted JSON bodies.
#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    max_field_len: usize,
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIELD_LEN)
    }
}

impl Formatter {
    #[must_use]
    pub fn new(max_field_len: usize) -> Self {
        Self { max_field_len }
    }

    #[must_use]
    pub fn from_config(config: &RedactionConfig) -> Self {
        Self::new(config.max_field_len)
    }

    #[must_use]
    pub fn max_field_len(&self) -> usize {
        self.max_field_len
    }

    #[must_use]
    pub fn row(&self, change: &RowChange) -> String {
        match &change.op {
            RowOp::Insert(row) => json_block("Insert", &change.table, &self.pretty(row)),
            RowOp::Update { old, new } => {
                let mut body = Map::new();
                body.insert("id".into(), new.get("id").cloned().unwrap_or(Value::Null));
                body.extend(diff(old, new));
                json_block("Update", &change.table, &self.pretty(&Value::Object(body)))
            },
            RowOp::Delete(row) => json_block("Delete", &change.table, &self.pretty(row)),
        }
    }

    #[must_use]
    pub fn document(&self, change: &DocumentChange) -> String {
        match &change.op {
            DocumentOp::Insert(doc) => json_block("Insert on", &change.collection, &self.pretty(doc)),
            DocumentOp::Update { id, updated_fields } => {
                let mut body = Map::new();
                body.insert("_id".into(), id.clone());
                body.extend(updated_fields.clone());
                json_block(
                    "Update on",
                    &change.collection,
                    &self.pretty(&Value::Object(body)),
                )
            },
        }
    }

    #[must_use]
    pub fn topic_record(&self, record: &TopicRecord) -> String {
        let value = serde_json::to_value(record).unwrap_or(Value::Null);
        bare_json_block(&self.pretty(&value))
    }

    fn pretty(&self, value: &Value) -> String {
        let value = redacted(value, self.max_field_len);
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[rstest]
    #[case("INSERT", "insert")]
    #[case("insert", "insert")]
    #[case("delete", "delete")]
    fn parses_actions_case_insensitively(#[case] action: &str, #[case] expected: &str) {
        let payload = json!({
            "action": action,
            "table_name": "orders",
            "database_name": "shop",
            "data": {"id": 1},
        });
        let change = RowChange::parse(&payload.to_string()).unwrap();
        assert_eq!(change.op.as_str(), expected);
        assert_eq!(change.database.as_deref(), Some("shop"));
    }

    #[test]
    fn parses_update_payload() {
        let payload = json!({
            "action": "update",
            "table_name": "orders",
            "database_name": "shop",
            "new_data": {"id": 7, "status": "paid"},
            "old_data": {"id": 7, "status": "open"},
        });
        let change = RowChange::parse(&payload.to_string()).unwrap();
        assert_eq!(change.op, RowOp::Update {
            old: json!({"id": 7, "status": "open"}),
            new: json!({"id": 7, "status": "paid"}),
        });
    }

    #[rstest]
    #[case("not json")]
    #[case(r#"{"action": "truncate", "table_name": "t"}"#)]
    #[case(r#"{"action": "insert", "table_name": "t"}"#)]
    #[case(r#"{"action": "insert", "data": {}}"#)]
    #[case(r#"{"action": "update", "table_name": "t", "old_data": {}}"#)]
    fn malformed_payloads(#[case] payload: &str) {
        assert!(matches!(
            RowChange::parse(payload),
            Err(Error::MalformedEvent { .. })
        ));
    }

    #[test]
    fn row_insert_layout() {
        let change = RowChange {
            database: None,
            table: "order_items".into(),
            op: RowOp::Insert(json!({"id": 1})),
        };
        assert_eq!(
            Formatter::default().row(&change),
            "Insert *order\\_items*:\n```json\n{\n  \"id\": 1\n}\n```\n"
        );
    }

    #[test]
    fn row_update_keeps_id_and_changed_fields_only() {
        let change = RowChange {
            database: None,
            table: "orders".into(),
            op: RowOp::Update {
                old: json!({"id": 7, "status": "open", "total": 10}),
                new: json!({"id": 7, "status": "paid", "total": 10}),
            },
        };
        let text = Formatter::default().row(&change);
        assert!(text.starts_with("Update *orders*:\n```json\n"));
        let body = text
            .trim_start_matches("Update *orders*:\n```json\n")
            .trim_end_matches("\n```\n");
        let parsed: Value = serde_json::from_str(body).unwrap();
        assert_eq!(parsed, json!({"id": 7, "status": "paid"}));
    }

    #[test]
    fn row_bodies_are_redacted() {
        let formatter = Formatter::new(4);
        let change = RowChange {
            database: None,
            table: "t".into(),
            op: RowOp::Delete(json!({"short": "abcd", "long": "abcde"})),
        };
        let text = formatter.row(&change);
        assert!(text.starts_with("Delete *t*:"));
        assert!(text.contains("\"short\": \"abcd\""));
        assert!(text.contains("\"long\": \"\""));
    }

    #[test]
    fn code_body_escapes_backticks() {
        let change = RowChange {
            database: None,
            table: "t".into(),
            op: RowOp::Insert(json!({"note": "`rm`"})),
        };
        assert!(Formatter::default().row(&change).contains(r"\`rm\`"));
    }

    #[test]
    fn document_update_merges_id_and_fields() {
        let mut fields = Map::new();
        fields.insert("name".into(), json!("x"));
        let change = DocumentChange {
            collection: "user_profiles".into(),
            op: DocumentOp::Update {
                id: json!({"$oid": "65f0"}),
                updated_fields: fields,
            },
        };
        let text = Formatter::default().document(&change);
        assert!(text.starts_with("Update on *user\\_profiles*:\n```json\n"));
        assert!(text.contains("\"$oid\": \"65f0\""));
        assert!(text.contains("\"name\": \"x\""));
    }

    #[test]
    fn document_insert_heading() {
        let change = DocumentChange {
            collection: "logs".into(),
            op: DocumentOp::Insert(json!({"_id": 1})),
        };
        assert!(Formatter::default()
            .document(&change)
            .starts_with("Insert on *logs*:\n```json\n"));
    }

    #[rstest]
    #[case(Some(br#"{"a": 1}"#.as_slice()), json!({"a": 1}))]
    #[case(Some(b"plain text".as_slice()), json!("plain text"))]
    #[case(None, Value::Null)]
    fn topic_payload_decoding(#[case] payload: Option<&[u8]>, #[case] expected: Value) {
        let record = TopicRecord::decode("events", 0, 5, payload).unwrap();
        assert_eq!(record.value, expected);
    }

    #[test]
    fn binary_topic_payload_is_malformed() {
        let err = TopicRecord::decode("events", 0, 5, Some(&[0xff, 0xfe])).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent { .. }));
    }

    #[test]
    fn topic_record_is_a_bare_block() {
        let record = TopicRecord::decode("events", 2, 42, Some(br#"{"k": "v"}"#)).unwrap();
        let text = Formatter::default().topic_record(&record);
        assert!(text.starts_with("```json\n{\n"));
        assert!(text.ends_with("\n```\n"));
        assert!(text.contains("\"topic\": \"events\""));
        assert!(text.contains("\"partition\": 2"));
        assert!(text.contains("\"offset\": 42"));
        assert!(text.contains("\"k\": \"v\""));
    }
}
