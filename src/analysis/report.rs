//! Per-tool repeatability report.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::stats::AxisStats;
use crate::calibration::ToolOffsetResult;

/// Statistics for one tool across its trials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolReport {
    pub tool: u32,
    pub trials: usize,
    /// Highest zero-based cycle index seen.
    pub last_cycle: u32,
    /// Mean millimetres per pixel over the trials.
    pub mpp: f64,
    pub x: AxisStats,
    pub y: AxisStats,
}

impl ToolReport {
    pub fn suspect(&self) -> bool {
        self.x.suspect || self.y.suspect
    }
}

/// Repeatability of every tool found in a result list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepeatabilityReport {
    pub tools: Vec<ToolReport>,
}

impl RepeatabilityReport {
    /// Group results by tool, preserving nothing but the per-tool order.
    pub fn from_results(results: &[ToolOffsetResult]) -> Self {
        let tools = group_by_tool(results)
            .into_iter()
            .filter_map(|(tool, trials)| {
                let xs: Vec<f64> = trials.iter().map(|r| r.x).collect();
                let ys: Vec<f64> = trials.iter().map(|r| r.y).collect();
                Some(ToolReport {
                    tool,
                    trials: trials.len(),
                    last_cycle: trials.iter().map(|r| r.cycle).max().unwrap_or(0),
                    mpp: trials.iter().map(|r| r.mpp).sum::<f64>() / trials.len() as f64,
                    x: AxisStats::from_values(&xs)?,
                    y: AxisStats::from_values(&ys)?,
                })
            })
            .collect();
        Self { tools }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool(&self, tool: u32) -> Option<&ToolReport> {
        self.tools.iter().find(|t| t.tool == tool)
    }

    /// Number of cycles covered, from the highest cycle index seen.
    pub fn cycles(&self) -> u32 {
        self.tools.iter().map(|t| t.last_cycle + 1).max().unwrap_or(0)
    }

    /// Mean mpp over all tools, for the resolution note.
    pub fn mpp(&self) -> f64 {
        if self.tools.is_empty() {
            return 0.0;
        }
        self.tools.iter().map(|t| t.mpp).sum::<f64>() / self.tools.len() as f64
    }
}

const RULE: &str =
    "+-------------------------------------------------------------------------------------------------------+";

impl fmt::Display for RepeatabilityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Repeatability statistics for {} repeats:", self.cycles())?;
        writeln!(f, "{}", RULE)?;
        writeln!(
            f,
            "|   |                   X                             |                        Y                        |"
        )?;
        writeln!(
            f,
            "| T |   Avg   |   Max   |   Min   |  StdDev |  Range  |   Avg   |   Max   |   Min   |  StdDev |  Range  |"
        )?;
        for t in &self.tools {
            write!(f, "| {:1} ", t.tool)?;
            for axis in [&t.x, &t.y] {
                write!(
                    f,
                    "| {:7.3} | {:7.3} | {:7.3} | {:7.3} | {:7.3} ",
                    axis.mean, axis.max, axis.min, axis.std_dev, axis.range
                )?;
            }
            writeln!(f, "|")?;
        }
        writeln!(f, "{}", RULE)?;
        for t in self.tools.iter().filter(|t| t.suspect()) {
            let mut axes = Vec::new();
            if t.x.suspect {
                axes.push("X");
            }
            if t.y.suspect {
                axes.push("Y");
            }
            writeln!(f, "T{}: check axis {}", t.tool, axes.join(", "))?;
        }
        write!(
            f,
            "Note: Repeatability cannot be better than one pixel (MPP={:.4}).",
            self.mpp()
        )
    }
}

fn group_by_tool(results: &[ToolOffsetResult]) -> BTreeMap<u32, Vec<&ToolOffsetResult>> {
    let mut groups: BTreeMap<u32, Vec<&ToolOffsetResult>> = BTreeMap::new();
    for result in results {
        groups.entry(result.tool).or_default().push(result);
    }
    groups
}

/// Per-tool X and Y values with each axis's mean subtracted, for plotting
/// scatter and histogram views.
pub fn centered_series(results: &[ToolOffsetResult]) -> BTreeMap<u32, (Vec<f64>, Vec<f64>)> {
    group_by_tool(results)
        .into_iter()
        .map(|(tool, trials)| {
            let n = trials.len() as f64;
            let mean_x = trials.iter().map(|r| r.x).sum::<f64>() / n;
            let mean_y = trials.iter().map(|r| r.y).sum::<f64>() / n;
            let xs = trials.iter().map(|r| r.x - mean_x).collect();
            let ys = trials.iter().map(|r| r.y - mean_y).collect();
            (tool, (xs, ys))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn result(tool: u32, cycle: u32, x: f64, y: f64) -> ToolOffsetResult {
        ToolOffsetResult {
            tool,
            cycle,
            mpp: 0.0125,
            x,
            y,
            elapsed_secs: 1.0,
        }
    }

    fn sample() -> Vec<ToolOffsetResult> {
        vec![
            result(0, 0, 0.10, -0.20),
            result(1, 0, 0.0, 1.0),
            result(0, 1, 0.11, -0.21),
            result(1, 1, 0.2, 1.0),
            result(0, 2, 0.10, -0.20),
            result(1, 2, 0.2, 1.0),
            result(0, 3, 0.11, -0.21),
            result(1, 3, 0.4, 1.0),
        ]
    }

    #[test]
    fn test_groups_by_tool() {
        let report = RepeatabilityReport::from_results(&sample());
        assert_eq!(report.tools.len(), 2);
        assert_eq!(report.cycles(), 4);

        let t0 = report.tool(0).unwrap();
        assert_eq!(t0.trials, 4);
        assert_relative_eq!(t0.x.mean, 0.105, epsilon = 1e-12);
        assert_relative_eq!(t0.mpp, 0.0125);
        assert!(!t0.suspect());

        let t1 = report.tool(1).unwrap();
        assert!(t1.x.suspect);
        assert!(!t1.y.suspect);
    }

    #[test]
    fn test_table_rendering() {
        let text = RepeatabilityReport::from_results(&sample()).to_string();
        assert!(text.starts_with("Repeatability statistics for 4 repeats:"));
        assert!(text.contains("| 0 |   0.105 |   0.110 |   0.100 |   0.005 |   0.010 |"));
        assert!(text.contains("T1: check axis X"));
        assert!(text.ends_with("(MPP=0.0125)."));
    }

    #[test]
    fn test_centered_series() {
        let series = centered_series(&sample());
        let (xs, ys) = &series[&1];
        assert_relative_eq!(xs.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(xs[0], -0.2, epsilon = 1e-12);
        assert!(ys.iter().all(|y| y.abs() < 1e-12));
    }

    #[test]
    fn test_empty_results() {
        let report = RepeatabilityReport::from_results(&[]);
        assert!(report.is_empty());
        assert_eq!(report.cycles(), 0);
    }
}
