//! Typed motion commands and their G-code rendering.
//!
//! The alignment core never builds command strings by hand. Every command it
//! sends is a [`MotionCommand`], rendered to the G-code dialect understood by
//! RepRapFirmware. [`MotionCommand::parse`] reads that same vocabulary back,
//! which is what the simulated machine uses to interpret what it is sent.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Matches a single G-code word such as `X-0.294` or `T1`.
static WORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z])\s*(-?\d*\.?\d+)").expect("G-code word pattern is valid")
});

/// A command issued to the motion controller.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCommand {
    /// Pick up a tool (`T<n>`).
    SelectTool(u32),
    /// Park the active tool (`T-1`).
    UnloadTool,
    /// Relative move, restoring absolute mode afterwards.
    MoveRelative {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feedrate: Option<f64>,
    },
    /// Absolute move in user coordinates.
    MoveAbsolute {
        x: Option<f64>,
        y: Option<f64>,
        z: Option<f64>,
        feedrate: Option<f64>,
    },
    /// Set the default feedrate without moving (`G1 F<f>`).
    SetFeedrate(f64),
    /// Enable or disable axis limits for moves (`M564 S<0|1>`).
    LimitAxes(bool),
    /// Single Z probe with the given probe number, not raising an error
    /// when nothing triggers (`G30 S-1 K<n>`).
    Probe { probe: u32 },
    /// Set a tool offset (`G10 P<t> X Y [Z]`).
    SetToolOffset {
        tool: u32,
        x: f64,
        y: f64,
        z: Option<f64>,
    },
    /// Persist tool offsets to `config-override.g` (`M500 P10`).
    SaveOffsets,
    /// Anything else, passed through verbatim.
    Raw(String),
}

impl MotionCommand {
    /// Relative XY move.
    pub fn relative_xy(x: f64, y: f64, feedrate: f64) -> Self {
        Self::MoveRelative {
            x: Some(x),
            y: Some(y),
            z: None,
            feedrate: Some(feedrate),
        }
    }

    /// Absolute XY move.
    pub fn absolute_xy(x: f64, y: f64, feedrate: Option<f64>) -> Self {
        Self::MoveAbsolute {
            x: Some(x),
            y: Some(y),
            z: None,
            feedrate,
        }
    }

    /// Absolute single-axis move, as used when restoring the carriage.
    pub fn absolute_axis(axis: char, value: f64) -> Self {
        let (mut x, mut y, mut z) = (None, None, None);
        match axis.to_ascii_uppercase() {
            'X' => x = Some(value),
            'Y' => y = Some(value),
            _ => z = Some(value),
        }
        Self::MoveAbsolute {
            x,
            y,
            z,
            feedrate: None,
        }
    }

    /// Render to G-code text.
    pub fn to_gcode(&self) -> String {
        self.to_string()
    }

    /// Parse a line produced by [`MotionCommand::to_gcode`].
    ///
    /// Lines outside the known vocabulary come back as [`MotionCommand::Raw`].
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let words: Vec<(char, String)> = WORD_RE
            .captures_iter(trimmed)
            .filter_map(|c| {
                let letter = c.get(1)?.as_str().chars().next()?.to_ascii_uppercase();
                Some((letter, c.get(2)?.as_str().to_string()))
            })
            .collect();

        let value = |letter: char| -> Option<f64> {
            words
                .iter()
                .find(|(l, _)| *l == letter)
                .and_then(|(_, v)| v.parse().ok())
        };
        let has = |letter: char, code: &str| words.iter().any(|(l, v)| *l == letter && v == code);

        match words.first() {
            Some(('T', v)) => match v.parse::<i64>() {
                Ok(n) if n < 0 => Self::UnloadTool,
                Ok(n) => Self::SelectTool(n as u32),
                Err(_) => Self::Raw(trimmed.to_string()),
            },
            Some(('M', v)) if v == "564" => Self::LimitAxes(value('S').unwrap_or(1.0) != 0.0),
            Some(('M', v)) if v == "500" => Self::SaveOffsets,
            Some(('G', v)) if v == "30" => Self::Probe {
                probe: value('K').unwrap_or(0.0) as u32,
            },
            Some(('G', v)) if v == "10" => match value('P') {
                Some(tool) => Self::SetToolOffset {
                    tool: tool as u32,
                    x: value('X').unwrap_or(0.0),
                    y: value('Y').unwrap_or(0.0),
                    z: value('Z'),
                },
                None => Self::Raw(trimmed.to_string()),
            },
            Some(('G', _)) if has('G', "1") || has('G', "0") => {
                let (x, y, z, feedrate) = (value('X'), value('Y'), value('Z'), value('F'));
                if x.is_none() && y.is_none() && z.is_none() {
                    return match feedrate {
                        Some(f) => Self::SetFeedrate(f),
                        None => Self::Raw(trimmed.to_string()),
                    };
                }
                if has('G', "91") {
                    Self::MoveRelative { x, y, z, feedrate }
                } else {
                    Self::MoveAbsolute { x, y, z, feedrate }
                }
            }
            _ => Self::Raw(trimmed.to_string()),
        }
    }
}

/// Format a coordinate with three decimals, never printing `-0.000`.
pub fn format_coord(value: f64) -> String {
    let rounded = round3(value);
    if rounded == 0.0 {
        "0.000".to_string()
    } else {
        format!("{:.3}", rounded)
    }
}

/// Round to three decimal places (the machine's working resolution).
pub fn round3(value: f64) -> f64 {
    let r = (value * 1000.0).round() / 1000.0;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

fn push_axes(out: &mut String, x: Option<f64>, y: Option<f64>, z: Option<f64>, f: Option<f64>) {
    for (letter, v) in [('X', x), ('Y', y), ('Z', z)] {
        if let Some(v) = v {
            out.push_str(&format!(" {}{}", letter, format_coord(v)));
        }
    }
    if let Some(f) = f {
        out.push_str(&format!(" F{}", f.round() as i64));
    }
}

impl fmt::Display for MotionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectTool(t) => write!(f, "T{}", t),
            Self::UnloadTool => write!(f, "T-1"),
            Self::MoveRelative {
                x,
                y,
                z,
                feedrate,
            } => {
                let mut s = "G91 G1".to_string();
                push_axes(&mut s, *x, *y, *z, *feedrate);
                write!(f, "{} G90", s)
            }
            Self::MoveAbsolute {
                x,
                y,
                z,
                feedrate,
            } => {
                let mut s = "G90 G1".to_string();
                push_axes(&mut s, *x, *y, *z, *feedrate);
                write!(f, "{}", s)
            }
            Self::SetFeedrate(feed) => write!(f, "G1 F{}", feed.round() as i64),
            Self::LimitAxes(on) => write!(f, "M564 S{}", if *on { 1 } else { 0 }),
            Self::Probe { probe } => write!(f, "G30 S-1 K{}", probe),
            Self::SetToolOffset { tool, x, y, z } => {
                write!(f, "G10 P{} X{} Y{}", tool, format_coord(*x), format_coord(*y))?;
                if let Some(z) = z {
                    write!(f, " Z{}", format_coord(*z))?;
                }
                Ok(())
            }
            Self::SaveOffsets => write!(f, "M500 P10"),
            Self::Raw(s) => write!(f, "{}", s),
        }
    }
}
