//! Core domain model shared by the acquisition and ingestion halves of exportline.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "exportline-core";

/// Lifecycle state of a server-side export job as shown in the portal's status table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Processing,
    Finished,
    /// Status text that matches none of the recognized states.
    Unknown(String),
    Empty,
}

impl ExportStatus {
    /// Classifies raw status cell text. Matching is case-insensitive and by containment,
    /// with "finished" taking precedence over the waiting states.
    pub fn classify(raw: &str) -> Self {
        let text = raw.trim().to_lowercase();
        if text.is_empty() {
            ExportStatus::Empty
        } else if text.contains("finished") {
            ExportStatus::Finished
        } else if text.contains("pending") {
            ExportStatus::Pending
        } else if text.contains("processing") {
            ExportStatus::Processing
        } else {
            ExportStatus::Unknown(text)
        }
    }

    /// True for the states that call for a refresh and another readiness poll.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ExportStatus::Pending | ExportStatus::Processing | ExportStatus::Empty
        )
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportStatus::Pending => f.write_str("pending"),
            ExportStatus::Processing => f.write_str("processing"),
            ExportStatus::Finished => f.write_str("finished"),
            ExportStatus::Unknown(text) => write!(f, "unknown({text})"),
            ExportStatus::Empty => f.write_str("empty"),
        }
    }
}

/// Opaque pointer to a status row's download control.
///
/// `generation` identifies the page state the handle was read from; any refresh
/// rebuilds the table and bumps the generation, so handles never survive a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    pub generation: u64,
    pub row_index: usize,
    pub href: Option<String>,
}

/// One row of the status table exactly as read from the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    pub display_name: String,
    pub status_text: String,
    pub handle: DownloadHandle,
}

impl StatusRow {
    /// Exact match on trimmed, lowercased display names.
    pub fn is_named(&self, display_name: &str) -> bool {
        normalize_display_name(&self.display_name) == normalize_display_name(display_name)
    }
}

pub fn normalize_display_name(input: &str) -> String {
    input.trim().to_lowercase()
}

/// An export job observed in one readiness poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub display_name: String,
    pub status: ExportStatus,
    pub row: DownloadHandle,
}

impl ExportJob {
    pub fn from_row(row: &StatusRow) -> Self {
        Self {
            display_name: row.display_name.trim().to_string(),
            status: ExportStatus::classify(&row.status_text),
            row: row.handle.clone(),
        }
    }
}

/// Destination table and column layout for files whose name contains `match_keyword`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub match_keyword: String,
    pub table_name: String,
    /// Bulk-insert column order.
    pub columns: Vec<String>,
}

impl SchemaDefinition {
    pub fn new(
        match_keyword: impl Into<String>,
        table_name: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            match_keyword: match_keyword.into(),
            table_name: table_name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches_filename(&self, file_name: &str) -> bool {
        file_name
            .to_lowercase()
            .contains(&self.match_keyword.to_lowercase())
    }
}

/// One parsed data row keyed by header name. Absent keys are absent fields.
pub type Record = BTreeMap<String, String>;

/// Ordered, nullable text values ready for a bulk insert.
pub type RowTuple = Vec<Option<String>>;

/// Records parsed from one routed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionBatch {
    pub source_file: PathBuf,
    pub schema: SchemaDefinition,
    pub records: Vec<Record>,
}

impl IngestionBatch {
    /// Projects every record onto `schema.columns`; absent or empty values become `None`.
    pub fn ordered_rows(&self) -> Vec<RowTuple> {
        self.records
            .iter()
            .map(|record| {
                self.schema
                    .columns
                    .iter()
                    .map(|column| {
                        record
                            .get(column)
                            .filter(|value| !value.is_empty())
                            .cloned()
                    })
                    .collect()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Identity of one end-to-end run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}
