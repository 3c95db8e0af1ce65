//! JSON export of alignment results.
//!
//! The file is a list of records with string values (`tool`, `cycle`,
//! `mpp`, `X`, `Y`) followed by one `{printer, datetime}` record.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calibration::ToolOffsetResult;
use crate::machine::format_coord;

/// Export and import errors.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid {field} value: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// One exported trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub tool: String,
    pub cycle: String,
    pub mpp: String,
    #[serde(rename = "X")]
    pub x: String,
    #[serde(rename = "Y")]
    pub y: String,
}

impl From<&ToolOffsetResult> for ResultRecord {
    fn from(result: &ToolOffsetResult) -> Self {
        Self {
            tool: result.tool.to_string(),
            cycle: result.cycle.to_string(),
            mpp: result.mpp.to_string(),
            x: format_coord(result.x),
            y: format_coord(result.y),
        }
    }
}

impl ResultRecord {
    pub fn to_result(&self) -> Result<ToolOffsetResult, ExportError> {
        Ok(ToolOffsetResult {
            tool: parse_field("tool", &self.tool)?,
            cycle: parse_field("cycle", &self.cycle)?,
            mpp: parse_field("mpp", &self.mpp)?,
            x: parse_field("X", &self.x)?,
            y: parse_field("Y", &self.y)?,
            elapsed_secs: 0.0,
        })
    }
}

/// Trailing record naming the machine and export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTrailer {
    pub printer: String,
    pub datetime: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ExportEntry {
    Result(ResultRecord),
    Trailer(ExportTrailer),
}

/// Contents of an export file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedResults {
    pub results: Vec<ToolOffsetResult>,
    pub trailer: Option<ExportTrailer>,
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ExportError> {
    value.trim().parse().map_err(|_| ExportError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// Serialise results and the trailer as pretty-printed JSON.
pub fn export_json(
    results: &[ToolOffsetResult],
    printer: &str,
    datetime: DateTime<Local>,
) -> Result<String, ExportError> {
    let mut entries: Vec<ExportEntry> = results
        .iter()
        .map(|r| ExportEntry::Result(r.into()))
        .collect();
    entries.push(ExportEntry::Trailer(ExportTrailer {
        printer: printer.to_string(),
        datetime: datetime.to_rfc3339(),
    }));
    Ok(serde_json::to_string_pretty(&entries)?)
}

/// Write an export file, stamped with the current time.
pub fn write_results(
    path: impl AsRef<Path>,
    results: &[ToolOffsetResult],
    printer: &str,
) -> Result<(), ExportError> {
    let json = export_json(results, printer, Local::now())?;
    fs::write(path.as_ref(), json)?;
    tracing::info!(path = %path.as_ref().display(), trials = results.len(), "exported results");
    Ok(())
}

/// Parse an export, keeping the trailer if present.
pub fn parse_export(json: &str) -> Result<ExportedResults, ExportError> {
    let entries: Vec<ExportEntry> = serde_json::from_str(json)?;
    let mut results = Vec::with_capacity(entries.len());
    let mut trailer = None;
    for entry in entries {
        match entry {
            ExportEntry::Result(record) => results.push(record.to_result()?),
            ExportEntry::Trailer(t) => trailer = Some(t),
        }
    }
    Ok(ExportedResults { results, trailer })
}

/// Parse the result records of an export, ignoring the trailer.
pub fn parse_results(json: &str) -> Result<Vec<ToolOffsetResult>, ExportError> {
    Ok(parse_export(json)?.results)
}

pub fn read_results(path: impl AsRef<Path>) -> Result<ExportedResults, ExportError> {
    parse_export(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> Vec<ToolOffsetResult> {
        vec![
            ToolOffsetResult {
                tool: 0,
                cycle: 0,
                mpp: 0.0125,
                x: 0.5,
                y: -0.2,
                elapsed_secs: 12.3,
            },
            ToolOffsetResult {
                tool: 1,
                cycle: 0,
                mpp: 0.0125,
                x: -30.1234,
                y: 0.0,
                elapsed_secs: 9.0,
            },
        ]
    }

    #[test]
    fn test_record_fields_are_strings() {
        let json = export_json(&results(), "http://duet.local", Local::now()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let list = value.as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0]["X"], "0.500");
        assert_eq!(list[0]["Y"], "-0.200");
        assert_eq!(list[1]["X"], "-30.123");
        assert_eq!(list[1]["tool"], "1");
        assert_eq!(list[2]["printer"], "http://duet.local");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.json");
        write_results(&path, &results(), "http://duet.local").unwrap();

        let read = read_results(&path).unwrap();
        assert_eq!(read.trailer.unwrap().printer, "http://duet.local");
        assert_eq!(read.results.len(), 2);
        for (original, parsed) in results().iter().zip(&read.results) {
            assert_eq!(parsed.tool, original.tool);
            assert_eq!(parsed.cycle, original.cycle);
            assert_eq!(parsed.mpp, original.mpp);
            assert_eq!(format_coord(parsed.x), format_coord(original.x));
            assert_eq!(format_coord(parsed.y), format_coord(original.y));
        }
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let json = r#"[{"tool": "0", "cycle": "0", "mpp": "0.01", "X": "abc", "Y": "0"}]"#;
        match parse_results(json) {
            Err(ExportError::InvalidValue { field, .. }) => assert_eq!(field, "X"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
