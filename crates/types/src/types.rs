//! Domain types for buckets, stored records, and workflow jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the record field holding the data version stamped by migrations.
pub const DATA_VERSION_FIELD: &str = "data_version";

/// JSON object stored under a record key.
pub type RecordValue = Map<String, Value>;

/// Secondary index type supported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    /// UTF-8 string.
    #[serde(rename = "string")]
    String,
    /// Integer or floating point number.
    #[serde(rename = "number")]
    Number,
    /// Boolean.
    #[serde(rename = "boolean")]
    Boolean,
    /// IPv4 or IPv6 address.
    #[serde(rename = "ip")]
    Ip,
    /// Array of strings, matched element-wise.
    #[serde(rename = "[string]")]
    StringArray,
    /// Array of numbers, matched element-wise.
    #[serde(rename = "[number]")]
    NumberArray,
}

impl IndexType {
    /// Returns true if the JSON value can be stored under an index of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::String | Self::Ip, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::StringArray, Value::Array(items)) => items.iter().all(Value::is_string),
            (Self::NumberArray, Value::Array(items)) => items.iter().all(Value::is_number),
            _ => false,
        }
    }
}

/// Definition of one indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index type.
    #[serde(rename = "type")]
    pub index_type: IndexType,
    /// Whether values must be unique across the bucket.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    /// Creates a non-unique index of the given type.
    #[must_use]
    pub const fn new(index_type: IndexType) -> Self {
        Self { index_type, unique: false }
    }

    /// Non-unique string index.
    #[must_use]
    pub const fn string() -> Self {
        Self::new(IndexType::String)
    }

    /// Non-unique number index.
    #[must_use]
    pub const fn number() -> Self {
        Self::new(IndexType::Number)
    }

    /// Non-unique boolean index.
    #[must_use]
    pub const fn boolean() -> Self {
        Self::new(IndexType::Boolean)
    }

    /// Marks the index as unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Bucket name, index schema, and schema version.
///
/// The version only ever increases for a given bucket name. A descriptor
/// whose version is lower than the stored one never regresses the stored
/// bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDescriptor {
    /// Logical bucket name.
    pub name: String,
    /// Indexed fields.
    #[serde(default)]
    pub index: BTreeMap<String, IndexDefinition>,
    /// Schema version.
    #[serde(default)]
    pub version: u32,
}

impl BucketDescriptor {
    /// Creates a descriptor with an empty index.
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self { name: name.into(), index: BTreeMap::new(), version }
    }

    /// Adds an indexed field.
    #[must_use]
    pub fn with_index(mut self, field: impl Into<String>, definition: IndexDefinition) -> Self {
        self.index.insert(field.into(), definition);
        self
    }

    /// Returns true if `field` is indexed.
    #[must_use]
    pub fn is_indexed(&self, field: &str) -> bool {
        self.index.contains_key(field)
    }

    /// Overlays this descriptor's indexes onto `stored`, keeping stored
    /// indexes this descriptor does not mention.
    #[must_use]
    pub fn merged_index(&self, stored: &BucketDescriptor) -> BTreeMap<String, IndexDefinition> {
        let mut merged = stored.index.clone();
        merged.extend(self.index.iter().map(|(field, def)| (field.clone(), *def)));
        merged
    }
}

/// Bucket as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBucket {
    /// Stored descriptor.
    pub descriptor: BucketDescriptor,
    /// Whether objects written under an older version still await reindexing.
    #[serde(default)]
    pub reindex_pending: bool,
}

/// A keyed object in a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Object key, unique within the bucket.
    pub key: String,
    /// Object value.
    pub value: RecordValue,
}

impl Record {
    /// Creates a record.
    #[must_use]
    pub fn new(key: impl Into<String>, value: RecordValue) -> Self {
        Self { key: key.into(), value }
    }

    /// Creates a record from a JSON value, treating non-objects as empty.
    #[must_use]
    pub fn from_json(key: impl Into<String>, value: Value) -> Self {
        let value = match value {
            Value::Object(map) => map,
            _ => RecordValue::new(),
        };
        Self::new(key, value)
    }

    /// Returns the value of a top-level field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.value.get(name)
    }

    /// Returns the data version stamped on this record, if any.
    #[must_use]
    pub fn data_version(&self) -> Option<u64> {
        self.value.get(DATA_VERSION_FIELD).and_then(Value::as_u64)
    }

    /// Stamps the record with a data version.
    pub fn set_data_version(&mut self, version: u32) {
        self.value.insert(DATA_VERSION_FIELD.to_string(), Value::from(version));
    }
}

/// Execution state of a workflow job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobExecution {
    /// Accepted but not yet picked up by a runner.
    Queued,
    /// Running.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failed task.
    Failed,
    /// Canceled before completion.
    Canceled,
}

impl JobExecution {
    /// Returns true for `succeeded`, `failed`, and `canceled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Outcome of one step of a workflow job's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainResult {
    /// Task name.
    pub name: String,
    /// Task result message.
    #[serde(default)]
    pub result: String,
    /// Task error message, empty on success.
    #[serde(default)]
    pub error: String,
    /// When the task started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task finished.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A long-running workflow job executed by the external workflow engine.
///
/// This layer only reads job records; it never mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub uuid: Uuid,
    /// Workflow name.
    #[serde(default)]
    pub name: String,
    /// Execution state.
    pub execution: JobExecution,
    /// Ordered step outcomes.
    #[serde(default)]
    pub chain_results: Vec<ChainResult>,
}

impl JobRecord {
    /// Returns true if the job reached a terminal execution state.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.execution.is_terminal()
    }
}

/// Payload published on the job notification topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    /// Job the notification refers to.
    pub job_uuid: Uuid,
    /// Execution state at publish time.
    pub execution: JobExecution,
    /// Full job record, when the publisher includes it.
    #[serde(default)]
    pub job: Option<JobRecord>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_index_type_serde_names() {
        let json = serde_json::to_string(&IndexType::StringArray).unwrap();
        assert_eq!(json, "\"[string]\"");
        let parsed: IndexType = serde_json::from_str("\"number\"").unwrap();
        assert_eq!(parsed, IndexType::Number);
    }

    #[test]
    fn test_index_type_accepts() {
        assert!(IndexType::String.accepts(&json!("running")));
        assert!(!IndexType::String.accepts(&json!(5)));
        assert!(IndexType::StringArray.accepts(&json!(["a", "b"])));
        assert!(!IndexType::StringArray.accepts(&json!(["a", 1])));
        assert!(IndexType::Number.accepts(&Value::Null));
    }

    #[test]
    fn test_merged_index_keeps_stored_fields() {
        let stored = BucketDescriptor::new("vms", 1)
            .with_index("uuid", IndexDefinition::string().unique())
            .with_index("alias", IndexDefinition::string());
        let desired = BucketDescriptor::new("vms", 2)
            .with_index("uuid", IndexDefinition::string().unique())
            .with_index("state", IndexDefinition::string());

        let merged = desired.merged_index(&stored);
        assert_eq!(merged.len(), 3);
        assert!(merged.contains_key("alias"));
        assert!(merged.contains_key("state"));
    }

    #[test]
    fn test_record_data_version() {
        let mut record = Record::from_json("k", json!({"uuid": "k"}));
        assert_eq!(record.data_version(), None);
        record.set_data_version(3);
        assert_eq!(record.data_version(), Some(3));
    }

    #[test]
    fn test_record_from_non_object_is_empty() {
        let record = Record::from_json("k", json!([1, 2]));
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_job_execution_terminal_states() {
        assert!(!JobExecution::Queued.is_terminal());
        assert!(!JobExecution::Running.is_terminal());
        assert!(JobExecution::Succeeded.is_terminal());
        assert!(JobExecution::Failed.is_terminal());
        assert!(JobExecution::Canceled.is_terminal());
    }

    #[test]
    fn test_job_notification_without_record() {
        let uuid = Uuid::new_v4();
        let payload = json!({"job_uuid": uuid, "execution": "failed"});
        let notification: JobNotification = serde_json::from_value(payload).unwrap();
        assert_eq!(notification.job_uuid, uuid);
        assert_eq!(notification.execution, JobExecution::Failed);
        assert!(notification.job.is_none());
    }
}
