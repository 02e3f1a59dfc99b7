use crate::models::{ContextHostRow, Entry};
use serde::Deserialize;
use std::{fs::File, io::Read, path::Path};
use thiserror::Error;
use tracing::warn;

const MANUFACTURER_COLUMN: &str = "MFR_NAME";
const ID_COLUMN: &str = "[<ID>]";
const URL_COLUMN: &str = "URL";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unable to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed table: {0}")]
    Csv(#[from] csv::Error),
    #[error("missing required column `{0}`")]
    MissingColumn(&'static str),
}

#[derive(Debug, Deserialize)]
struct EntryRow {
    #[serde(rename = "MFR_NAME", default)]
    manufacturer: Option<String>,
    #[serde(rename = "Part Number", default)]
    part_number: Option<String>,
    #[serde(rename = "Product Description", default)]
    description: Option<String>,
    #[serde(rename = "[<ID>]", default)]
    sku_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostRow {
    #[serde(rename = "MFR_NAME", default)]
    manufacturer: Option<String>,
    #[serde(rename = "URL", default)]
    url: Option<String>,
    #[serde(rename = "ENTERPRISE_NAME", default)]
    enterprise_name: Option<String>,
}

pub fn read_entries(path: &Path) -> Vec<Entry> {
    match open(path).and_then(parse_entries) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(target = "imagery.ingest", path = %path.display(), error = %err, "entries_unreadable");
            Vec::new()
        }
    }
}

pub fn read_context_hosts(path: &Path) -> Vec<ContextHostRow> {
    match open(path).and_then(parse_context_hosts) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(target = "imagery.ingest", path = %path.display(), error = %err, "context_hosts_unreadable");
            Vec::new()
        }
    }
}

pub fn parse_entries<R: Read>(input: R) -> Result<Vec<Entry>, IngestError> {
    let mut reader = reader(input);
    require_columns(&mut reader, &[MANUFACTURER_COLUMN, ID_COLUMN])?;

    let mut entries = Vec::new();
    for (line, row) in reader.deserialize::<EntryRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                warn!(target = "imagery.ingest", line = line + 2, error = %err, "entry_row_skipped");
                continue;
            }
        };
        let (Some(manufacturer), Some(sku_id)) = (non_blank(row.manufacturer), non_blank(row.sku_id))
        else {
            continue;
        };
        entries.push(Entry {
            manufacturer,
            part_number: non_blank(row.part_number),
            description: non_blank(row.description),
            sku_id,
        });
    }
    Ok(entries)
}

pub fn parse_context_hosts<R: Read>(input: R) -> Result<Vec<ContextHostRow>, IngestError> {
    let mut reader = reader(input);
    require_columns(&mut reader, &[MANUFACTURER_COLUMN, URL_COLUMN])?;

    let mut rows = Vec::new();
    for (line, row) in reader.deserialize::<HostRow>().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                warn!(target = "imagery.ingest", line = line + 2, error = %err, "context_row_skipped");
                continue;
            }
        };
        let (Some(manufacturer), Some(url)) = (non_blank(row.manufacturer), non_blank(row.url)) else {
            continue;
        };
        rows.push(ContextHostRow {
            manufacturer,
            url,
            enterprise_name: non_blank(row.enterprise_name),
        });
    }
    Ok(rows)
}

fn open(path: &Path) -> Result<File, IngestError> {
    File::open(path).map_err(|source| IngestError::Open {
        path: path.display().to_string(),
        source,
    })
}

fn reader<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input)
}

fn require_columns<R: Read>(
    reader: &mut csv::Reader<R>,
    required: &[&'static str],
) -> Result<(), IngestError> {
    let headers = reader.headers()?;
    for column in required {
        if !headers.iter().any(|h| h == *column) {
            return Err(IngestError::MissingColumn(column));
        }
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
