use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// One catalog row awaiting imagery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub manufacturer: String,
    #[serde(default)]
    pub part_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub sku_id: String,
}

impl Entry {
    /// Part number when present, otherwise the catalog id. Used for file stems and the
    /// sidecar `product.sku` field.
    pub fn product_key(&self) -> &str {
        self.part_number
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.sku_id)
    }
}

/// Raw manufacturer → URL mapping row, before tier derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHostRow {
    pub manufacturer: String,
    pub url: String,
    #[serde(default)]
    pub enterprise_name: Option<String>,
}

/// Trust rank of a source. Ordering follows search priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Oem,
    Enterprise,
    Distributor,
    Unknown,
    General,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Oem => "OEM",
            Tier::Enterprise => "Enterprise",
            Tier::Distributor => "Distributor",
            Tier::Unknown => "Unknown",
            Tier::General => "General",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextHost {
    pub manufacturer: String,
    pub host: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub url: String,
    pub host: String,
}

/// One record of `sku_metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuRecord {
    pub sku: String,
    pub manufacturer: String,
    pub part_number: Option<String>,
    pub image_urls: Vec<String>,
}

/// Parameters submitted by the front end to start a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunRequest {
    pub entries_path: PathBuf,
    pub context_hosts_path: PathBuf,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub range_start: Option<usize>,
    #[serde(default)]
    pub range_end: Option<usize>,
}

impl RunRequest {
    pub fn range(&self) -> EntryRange {
        EntryRange {
            start: self.range_start.unwrap_or(0),
            end: self.range_end.unwrap_or(0),
        }
    }
}

/// 1-based inclusive window over the entry list; zero leaves a side unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryRange {
    pub start: usize,
    pub end: usize,
}

impl EntryRange {
    pub fn contains(&self, index: usize) -> bool {
        let after_start = self.start == 0 || index + 1 >= self.start;
        let before_end = self.end == 0 || index < self.end;
        after_start && before_end
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
