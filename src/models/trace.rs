// Traces: a header used for listing plus a body kept in the blob store.

use serde::{Deserialize, Serialize};
use wincode::{SchemaRead, SchemaWrite};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct TraceAttribute {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub depth: u32,
    pub start_offset_nanos: u64,
    pub duration_nanos: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, SchemaRead, SchemaWrite)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub transaction_type: String,
    pub transaction_name: String,
    pub start_time: i64,
    pub capture_time: i64,
    pub duration_nanos: u64,
    pub headline: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub error: bool,
    /// Empty when the trace did not end in error.
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub attributes: Vec<TraceAttribute>,
    #[serde(default)]
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("empty trace id".into());
        }
        if self.transaction_type.trim().is_empty() {
            return Err(format!("trace {}: empty transaction type", self.id));
        }
        super::validate_capture_time(self.capture_time)
            .map_err(|e| format!("trace {}: {e}", self.id))?;
        if i64::try_from(self.duration_nanos).is_err() {
            return Err(format!(
                "trace {}: duration {} exceeds {}",
                self.id,
                self.duration_nanos,
                i64::MAX
            ));
        }
        if self.attributes.iter().any(|a| a.name.trim().is_empty()) {
            return Err(format!("trace {}: empty attribute name", self.id));
        }
        Ok(())
    }
}

/// Listing row for a stored trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceHeader {
    pub id: String,
    pub transaction_type: String,
    pub transaction_name: String,
    pub capture_time: i64,
    pub duration_nanos: u64,
    pub error: bool,
    pub headline: String,
}
