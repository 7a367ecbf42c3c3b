use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};

use crate::error::CacheError;

/// When stored results of a computation stop being served.
///
/// Relative forms are anchored when the computation is wrapped, not when a
/// result is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expire {
    /// Whole days from now; negative values are already expired.
    Days(i64),
    After(TimeDelta),
    /// Midnight UTC at the start of the date.
    On(NaiveDate),
    At(DateTime<Utc>),
}

impl Expire {
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Days(days) => shift(now, TimeDelta::try_days(days), days < 0),
            Self::After(delta) => shift(now, Some(delta), delta < TimeDelta::zero()),
            Self::On(date) => date.and_time(NaiveTime::MIN).and_utc(),
            Self::At(at) => at,
        }
    }
}

fn shift(now: DateTime<Utc>, delta: Option<TimeDelta>, backwards: bool) -> DateTime<Utc> {
    delta
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(if backwards {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

impl From<i64> for Expire {
    fn from(days: i64) -> Self {
        Self::Days(days)
    }
}

impl From<i32> for Expire {
    fn from(days: i32) -> Self {
        Self::Days(i64::from(days))
    }
}

impl From<TimeDelta> for Expire {
    fn from(delta: TimeDelta) -> Self {
        Self::After(delta)
    }
}

impl From<std::time::Duration> for Expire {
    fn from(duration: std::time::Duration) -> Self {
        Self::After(TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX))
    }
}

impl From<NaiveDate> for Expire {
    fn from(date: NaiveDate) -> Self {
        Self::On(date)
    }
}

impl From<DateTime<Utc>> for Expire {
    fn from(at: DateTime<Utc>) -> Self {
        Self::At(at)
    }
}

/// Accepts `7` (days), `12h`/`30m`/`45s`/`2d`, `2026-01-31` and RFC 3339
/// timestamps.
impl FromStr for Expire {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Ok(days) = value.parse::<i64>() {
            return Ok(Self::Days(days));
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Ok(Self::On(date));
        }
        if let Ok(at) = DateTime::parse_from_rfc3339(value) {
            return Ok(Self::At(at.with_timezone(&Utc)));
        }

        let invalid = || CacheError::config(format!("invalid expiration `{value}`"));
        let (split, unit) = value.char_indices().next_back().ok_or_else(invalid)?;
        let amount: i64 = value[..split].trim().parse().map_err(|_| invalid())?;
        let delta = match unit {
            'd' => TimeDelta::try_days(amount),
            'h' => TimeDelta::try_hours(amount),
            'm' => TimeDelta::try_minutes(amount),
            's' => TimeDelta::try_seconds(amount),
            _ => None,
        };
        delta.map(Self::After).ok_or_else(invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn every_form_resolves_to_an_absolute_timestamp() {
        assert_eq!(
            Expire::Days(-1).resolve(now()).to_rfc3339(),
            "2026-02-28T12:00:00+00:00"
        );
        assert_eq!(
            Expire::from(TimeDelta::hours(2)).resolve(now()).to_rfc3339(),
            "2026-03-01T14:00:00+00:00"
        );
        let date = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        assert_eq!(
            Expire::On(date).resolve(now()).to_rfc3339(),
            "2026-04-01T00:00:00+00:00"
        );
        assert_eq!(Expire::Days(i64::MAX).resolve(now()), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn parses_configuration_strings() {
        assert_eq!("7".parse::<Expire>().unwrap(), Expire::Days(7));
        assert_eq!("-1".parse::<Expire>().unwrap(), Expire::Days(-1));
        assert_eq!(
            "90m".parse::<Expire>().unwrap(),
            Expire::After(TimeDelta::minutes(90))
        );
        assert!(matches!(
            "2026-01-31".parse::<Expire>().unwrap(),
            Expire::On(_)
        ));
        assert!(matches!(
            "2026-01-31T08:00:00Z".parse::<Expire>().unwrap(),
            Expire::At(_)
        ));
        assert!("soon".parse::<Expire>().is_err());
    }

    #[test]
    fn unknown_units_are_rejected_not_split_mid_character() {
        for value in ["5µ", "µ", "12 часов", "3日"] {
            assert!(
                matches!(value.parse::<Expire>(), Err(CacheError::Config { .. })),
                "`{value}` should be rejected"
            );
        }
    }
}
