//! Inclusive calendar date ranges.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive `[start, end]` date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// The `days`-long window whose last day is `end`. `days` below 1 is treated as 1.
    pub fn ending_on(end: NaiveDate, days: i64) -> Self {
        let span = days.max(1) - 1;
        Self {
            start: end - Duration::days(span),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Same end, start moved `days` earlier.
    pub fn extend_back(&self, days: i64) -> Self {
        Self {
            start: self.start - Duration::days(days.max(0)),
            end: self.end,
        }
    }

    /// Number of calendar days covered.
    pub fn calendar_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(DateWindow::new(d("2024-01-03"), d("2024-01-02")).is_none());
        assert!(DateWindow::new(d("2024-01-02"), d("2024-01-02")).is_some());
    }

    #[test]
    fn ending_on_is_inclusive() {
        let w = DateWindow::ending_on(d("2024-01-30"), 30);
        assert_eq!(w.start, d("2024-01-01"));
        assert_eq!(w.calendar_days(), 30);
        assert!(w.contains(d("2024-01-01")));
        assert!(w.contains(d("2024-01-30")));
        assert!(!w.contains(d("2024-01-31")));
    }

    #[test]
    fn extend_back_keeps_end() {
        let w = DateWindow::single(d("2024-01-02")).extend_back(10);
        assert_eq!(w.start, d("2023-12-23"));
        assert_eq!(w.end, d("2024-01-02"));
    }
}
