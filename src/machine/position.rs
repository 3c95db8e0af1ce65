//! Axis-letter keyed machine coordinates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A set of axis coordinates (user/workspace space unless stated otherwise).
///
/// Keys are upper-case axis letters. Values are only ever read by the
/// alignment core; positions are always re-queried from the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachinePosition {
    axes: BTreeMap<char, f64>,
}

impl MachinePosition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a position from `(axis, value)` pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (char, f64)>,
    {
        let mut position = Self::new();
        for (axis, value) in pairs {
            position.set(axis, value);
        }
        position
    }

    /// Shorthand for an XYZ position.
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self::from_pairs([('X', x), ('Y', y), ('Z', z)])
    }

    pub fn set(&mut self, axis: char, value: f64) {
        self.axes.insert(axis.to_ascii_uppercase(), value);
    }

    /// Value for an axis, if the controller reported it.
    pub fn axis(&self, axis: char) -> Option<f64> {
        self.axes.get(&axis.to_ascii_uppercase()).copied()
    }

    /// Value for an axis, treating a missing axis as zero.
    pub fn axis_or_zero(&self, axis: char) -> f64 {
        self.axis(axis).unwrap_or(0.0)
    }

    pub fn x(&self) -> f64 {
        self.axis_or_zero('X')
    }

    pub fn y(&self) -> f64 {
        self.axis_or_zero('Y')
    }

    pub fn z(&self) -> f64 {
        self.axis_or_zero('Z')
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, f64)> + '_ {
        self.axes.iter().map(|(k, v)| (*k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }
}

impl fmt::Display for MachinePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .axes
            .iter()
            .map(|(axis, value)| format!("{}:{:.3}", axis, value))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_lookup_is_case_insensitive() {
        let mut pos = MachinePosition::new();
        pos.set('x', 12.5);
        assert_eq!(pos.axis('X'), Some(12.5));
        assert_eq!(pos.axis('x'), Some(12.5));
        assert_eq!(pos.axis('U'), None);
        assert_eq!(pos.axis_or_zero('U'), 0.0);
    }

    #[test]
    fn test_display() {
        let pos = MachinePosition::xyz(100.0, 50.0, 10.0);
        assert_eq!(pos.to_string(), "{X:100.000, Y:50.000, Z:10.000}");
    }
}
