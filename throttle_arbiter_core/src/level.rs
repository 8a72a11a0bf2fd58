use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Priority tier requested by an observer or enforced by hand.
///
/// Ordering follows declaration order. `Unknown` sorts lowest and doubles as the
/// "nothing enforced" marker, so an observer scan never produces it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityLevel {
    pub const ALL: [PriorityLevel; 5] = [
        PriorityLevel::Unknown,
        PriorityLevel::Low,
        PriorityLevel::Medium,
        PriorityLevel::High,
        PriorityLevel::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Stable numeric code, used across the C ABI and in snapshots.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    #[inline]
    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown priority level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown priority level: {0:?}")]
pub struct ParseLevelError(pub String);

impl FromStr for PriorityLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.as_str().eq_ignore_ascii_case(t))
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_tiers() {
        assert!(PriorityLevel::Unknown < PriorityLevel::Low);
        assert!(PriorityLevel::Low < PriorityLevel::Medium);
        assert!(PriorityLevel::Medium < PriorityLevel::High);
        assert!(PriorityLevel::High < PriorityLevel::Critical);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(" HIGH ".parse::<PriorityLevel>(), Ok(PriorityLevel::High));
        assert_eq!("medium".parse::<PriorityLevel>(), Ok(PriorityLevel::Medium));
        assert!("urgent".parse::<PriorityLevel>().is_err());
    }

    #[test]
    fn numeric_codes() {
        assert_eq!(PriorityLevel::from_u8(PriorityLevel::High.as_u8()), Some(PriorityLevel::High));
        assert_eq!(PriorityLevel::from_u8(5), None);
    }
}
