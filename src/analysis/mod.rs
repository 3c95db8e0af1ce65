//! Repeatability analysis and result export.

mod export;
mod report;
mod stats;

pub use export::{
    export_json, parse_export, parse_results, read_results, write_results, ExportError, ExportTrailer,
    ExportedResults, ResultRecord,
};
pub use report::{centered_series, RepeatabilityReport, ToolReport};
pub use stats::{is_suspect, median, AxisStats, EXPECTED_WITHIN_1_SIGMA, SUSPECT_SPREAD_MM};
