//! Time window expressions used by the inspector.
//!
//! Accepted forms:
//! - `today`, `yesterday` (UTC calendar days)
//! - a lookback such as `-180s`, `-3m`, `-2.5h`, `-1d`
//! - an inclusive date range `2016-10-11,2016-10-13`

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::error::{Error, Result};

/// Half-open interval `[start, end)`; `end == None` means "until now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Parse a window expression relative to `now`.
    pub fn parse(expr: &str, now: DateTime<Utc>) -> Result<Self> {
        let expr = expr.trim();
        let today = midnight(now.date_naive());

        match expr {
            "today" => {
                return Ok(Self {
                    start: today,
                    end: None,
                });
            }
            "yesterday" => {
                return Ok(Self {
                    start: today - Duration::days(1),
                    end: Some(today),
                });
            }
            _ => {}
        }

        if let Some(lookback) = expr.strip_prefix('-') {
            let seconds = parse_lookback(lookback).ok_or_else(|| Error::InvalidWindow(expr.to_string()))?;
            return Ok(Self {
                start: now - Duration::milliseconds((seconds * 1000.0) as i64),
                end: None,
            });
        }

        if let Some((from, to)) = expr.split_once(',') {
            let from = parse_date(from).ok_or_else(|| Error::InvalidWindow(expr.to_string()))?;
            let to = parse_date(to).ok_or_else(|| Error::InvalidWindow(expr.to_string()))?;
            if to < from {
                return Err(Error::InvalidWindow(expr.to_string()));
            }
            return Ok(Self {
                start: midnight(from),
                end: Some(midnight(to) + Duration::days(1)),
            });
        }

        Err(Error::InvalidWindow(expr.to_string()))
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && self.end.is_none_or(|end| ts < end)
    }
}

fn parse_lookback(s: &str) -> Option<f64> {
    let unit = s.chars().last()?;
    let factor = match unit {
        's' => 1.0,
        'm' => 60.0,
        'h' => 60.0 * 60.0,
        'd' => 60.0 * 60.0 * 24.0,
        _ => return None,
    };
    let value: f64 = s[..s.len() - 1].parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value * factor)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 10, 12, 15, 30, 0).unwrap()
    }

    #[test]
    fn test_today() {
        let w = TimeWindow::parse("today", now()).unwrap();
        assert_eq!(w.start, Utc.with_ymd_and_hms(2016, 10, 12, 0, 0, 0).unwrap());
        assert!(w.end.is_none());
        assert!(w.contains(now()));
    }

    #[test]
    fn test_yesterday_excludes_today() {
        let w = TimeWindow::parse("yesterday", now()).unwrap();
        assert!(w.contains(Utc.with_ymd_and_hms(2016, 10, 11, 23, 59, 59).unwrap()));
        assert!(!w.contains(Utc.with_ymd_and_hms(2016, 10, 12, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_lookback_units() {
        let w = TimeWindow::parse("-24h", now()).unwrap();
        assert_eq!(w.start, now() - Duration::hours(24));

        let w = TimeWindow::parse("-2.5h", now()).unwrap();
        assert_eq!(w.start, now() - Duration::minutes(150));

        let w = TimeWindow::parse("-90s", now()).unwrap();
        assert_eq!(w.start, now() - Duration::seconds(90));
    }

    #[test]
    fn test_date_range_is_inclusive() {
        let w = TimeWindow::parse("2016-10-11,2016-10-13", now()).unwrap();
        assert!(w.contains(Utc.with_ymd_and_hms(2016, 10, 13, 23, 0, 0).unwrap()));
        assert!(!w.contains(Utc.with_ymd_and_hms(2016, 10, 14, 0, 0, 0).unwrap()));
        assert!(!w.contains(Utc.with_ymd_and_hms(2016, 10, 10, 23, 0, 0).unwrap()));
    }

    #[test]
    fn test_unknown_expressions_rejected() {
        for expr in ["last week", "-3w", "-h", "2016-10-13,2016-10-11", ""] {
            assert!(
                matches!(TimeWindow::parse(expr, now()), Err(Error::InvalidWindow(_))),
                "{expr} should be rejected"
            );
        }
    }
}
