//! Expiration policy strings
//!
//! | Form  | Meaning                                              |
//! |-------|------------------------------------------------------|
//! | `""`  | no policy, leave any schedule untouched              |
//! | `"0"` | cancel any scheduled event                           |
//! | `"N"` | one-shot event in N seconds unless one is scheduled  |
//! | `"+N"`| one-shot event in N seconds, replacing any schedule  |
//! | `"-N"`| repeating event every N seconds                      |

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Parsed form of a `KeyInfo::expire` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirePolicy {
    /// Nothing to do
    Keep,
    /// Cancel any pending event
    Cancel,
    /// One-shot, only if none is scheduled
    Once(u64),
    /// One-shot, always overwriting
    Reset(u64),
    /// Repeating refresh
    Repeat(u64),
}

impl ExpirePolicy {
    /// Parse a policy string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(ExpirePolicy::Keep);
        }

        let invalid = || Error::InvalidExpire(raw.to_string());
        let (sign, digits) = match raw.as_bytes()[0] {
            b'+' | b'-' => (Some(raw.as_bytes()[0]), &raw[1..]),
            _ => (None, raw),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let seconds: u64 = digits.parse().map_err(|_| invalid())?;

        Ok(match (sign, seconds) {
            (_, 0) => ExpirePolicy::Cancel,
            (None, n) => ExpirePolicy::Once(n),
            (Some(b'+'), n) => ExpirePolicy::Reset(n),
            (Some(_), n) => ExpirePolicy::Repeat(n),
        })
    }

    /// Delay until the event fires, if one is to be scheduled.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            ExpirePolicy::Once(n) | ExpirePolicy::Reset(n) | ExpirePolicy::Repeat(n) => {
                Some(Duration::from_secs(*n))
            }
            ExpirePolicy::Keep | ExpirePolicy::Cancel => None,
        }
    }

    /// One-shot policies migrate and evict when they fire.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, ExpirePolicy::Once(_) | ExpirePolicy::Reset(_))
    }

    pub fn is_repeating(&self) -> bool {
        matches!(self, ExpirePolicy::Repeat(_))
    }

    /// Registration mode handed to the distributed store.
    pub fn schedule_mode(&self) -> Option<ScheduleMode> {
        match self {
            ExpirePolicy::Keep => None,
            ExpirePolicy::Cancel => Some(ScheduleMode::Cancel),
            ExpirePolicy::Once(_) => Some(ScheduleMode::IfAbsent),
            ExpirePolicy::Reset(_) | ExpirePolicy::Repeat(_) => Some(ScheduleMode::Overwrite),
        }
    }
}

impl fmt::Display for ExpirePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpirePolicy::Keep => Ok(()),
            ExpirePolicy::Cancel => write!(f, "0"),
            ExpirePolicy::Once(n) => write!(f, "{}", n),
            ExpirePolicy::Reset(n) => write!(f, "+{}", n),
            ExpirePolicy::Repeat(n) => write!(f, "-{}", n),
        }
    }
}

/// How the distributed store should register a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Remove any registered marker
    Cancel,
    /// Register only if no live marker exists
    IfAbsent,
    /// Register, replacing any live marker
    Overwrite,
}

impl ScheduleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleMode::Cancel => "cancel",
            ScheduleMode::IfAbsent => "if-absent",
            ScheduleMode::Overwrite => "overwrite",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_forms() {
        assert_eq!(ExpirePolicy::parse("").unwrap(), ExpirePolicy::Keep);
        assert_eq!(ExpirePolicy::parse("0").unwrap(), ExpirePolicy::Cancel);
        assert_eq!(ExpirePolicy::parse("-0").unwrap(), ExpirePolicy::Cancel);
        assert_eq!(ExpirePolicy::parse("120").unwrap(), ExpirePolicy::Once(120));
        assert_eq!(ExpirePolicy::parse("+30").unwrap(), ExpirePolicy::Reset(30));
        assert_eq!(ExpirePolicy::parse("-5").unwrap(), ExpirePolicy::Repeat(5));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_matches!(ExpirePolicy::parse("abc"), Err(Error::InvalidExpire(_)));
        assert_matches!(ExpirePolicy::parse("+"), Err(Error::InvalidExpire(_)));
        assert_matches!(ExpirePolicy::parse("1.5"), Err(Error::InvalidExpire(_)));
        assert_matches!(ExpirePolicy::parse("--3"), Err(Error::InvalidExpire(_)));
    }

    #[test]
    fn test_display_roundtrip() {
        for raw in ["0", "10", "+10", "-10"] {
            assert_eq!(ExpirePolicy::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_schedule_mode() {
        assert_eq!(
            ExpirePolicy::Once(3).schedule_mode(),
            Some(ScheduleMode::IfAbsent)
        );
        assert_eq!(
            ExpirePolicy::Repeat(3).schedule_mode(),
            Some(ScheduleMode::Overwrite)
        );
        assert_eq!(ExpirePolicy::Cancel.schedule_mode(), Some(ScheduleMode::Cancel));
        assert_eq!(ExpirePolicy::Keep.schedule_mode(), None);
    }
}
