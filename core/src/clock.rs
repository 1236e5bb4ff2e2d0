use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};

/// Offset used when no timezone is configured (UTC-03:00).
pub const DEFAULT_UTC_OFFSET: &str = "-03:00";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClockError {
    #[error("Invalid UTC offset {0}, expected +HH:MM or -HH:MM")]
    InvalidOffset(String),
}

/// Source of the timestamps written by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    offset: FixedOffset,
    frozen: Option<DateTime<FixedOffset>>,
}

impl Clock {
    pub fn new(offset: FixedOffset) -> Self {
        Clock { offset, frozen: None }
    }

    /// Parses `+HH:MM`, `-HH:MM`, `Z` or `UTC`.
    pub fn from_offset_str(offset: &str) -> Result<Self, ClockError> {
        let trimmed = offset.trim();
        if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
            return Ok(Clock::new(Utc.fix()));
        }

        FixedOffset::from_str(trimmed)
            .map(Clock::new)
            .map_err(|_| ClockError::InvalidOffset(offset.to_string()))
    }

    /// Always returns `at`, converted to its own offset.
    pub fn frozen(at: DateTime<FixedOffset>) -> Self {
        Clock { offset: *at.offset(), frozen: Some(at) }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.frozen.unwrap_or_else(|| self.localize(Utc::now()))
    }

    pub fn localize(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new(FixedOffset::west_opt(3 * 3600).unwrap_or(Utc.fix()))
    }
}
