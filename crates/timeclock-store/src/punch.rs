//! Clock-in / clock-out records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use timeclock_core::IdentityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunchKind {
    In,
    Out,
}

impl PunchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PunchKind::In => "in",
            PunchKind::Out => "out",
        }
    }

    /// Kind of the next punch given the employee's most recent one.
    ///
    /// An open clock-in from the same UTC day is closed with `Out`; anything
    /// else (no history, last was `Out`, or an `In` left open on an earlier
    /// day) starts a new shift.
    pub fn next_after(last: Option<&Punch>, now: DateTime<Utc>) -> PunchKind {
        match last {
            Some(p) if p.kind == PunchKind::In && p.at.date_naive() == now.date_naive() => {
                PunchKind::Out
            }
            _ => PunchKind::In,
        }
    }
}

impl fmt::Display for PunchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown punch kind: {0:?}")]
pub struct ParsePunchKindError(String);

impl FromStr for PunchKind {
    type Err = ParsePunchKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(PunchKind::In),
            "out" => Ok(PunchKind::Out),
            other => Err(ParsePunchKindError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Punch {
    pub id: String,
    pub employee_id: IdentityId,
    pub kind: PunchKind,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn punch(kind: PunchKind, at: DateTime<Utc>) -> Punch {
        Punch {
            id: "p1".into(),
            employee_id: IdentityId::from("alice"),
            kind,
            at,
        }
    }

    #[test]
    fn test_first_punch_is_in() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert_eq!(PunchKind::next_after(None, now), PunchKind::In);
    }

    #[test]
    fn test_open_shift_same_day_closes() {
        let clock_in = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap();
        let last = punch(PunchKind::In, clock_in);
        assert_eq!(PunchKind::next_after(Some(&last), now), PunchKind::Out);
    }

    #[test]
    fn test_after_out_starts_new_shift() {
        let clock_out = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap();
        let last = punch(PunchKind::Out, clock_out);
        assert_eq!(PunchKind::next_after(Some(&last), now), PunchKind::In);
    }

    #[test]
    fn test_forgotten_clock_out_does_not_carry_over() {
        let yesterday = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 15, 0).unwrap();
        let last = punch(PunchKind::In, yesterday);
        assert_eq!(PunchKind::next_after(Some(&last), now), PunchKind::In);
    }

    #[test]
    fn test_kind_text_round_trip() {
        assert_eq!("in".parse::<PunchKind>().unwrap(), PunchKind::In);
        assert_eq!(PunchKind::Out.to_string(), "out");
        assert!("IN".parse::<PunchKind>().is_err());
        assert_eq!(serde_json::to_string(&PunchKind::Out).unwrap(), "\"out\"");
    }
}
