// src/policy/window.rs

//! Installation time window

use crate::error::{Error, Result};
use chrono::NaiveTime;
use std::collections::BTreeSet;
use std::fmt;

/// A daily window (`HH:MM`-`HH:MM`) in which installations may run
///
/// Windows whose end lies before their start cross midnight. Products on
/// the exception list are installed at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub exceptions: BTreeSet<String>,
}

impl InstallationWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            exceptions: BTreeSet::new(),
        }
    }

    /// Parse `HH:MM` bounds plus exception product ids
    pub fn parse<I, S>(start: &str, end: &str, exceptions: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut window = Self::new(parse_time(start)?, parse_time(end)?);
        window.exceptions = exceptions.into_iter().map(Into::into).collect();
        Ok(window)
    }

    /// Whether `now` falls inside the window (bounds inclusive)
    pub fn contains(&self, now: NaiveTime) -> bool {
        in_installation_window(self.start, self.end, now)
    }

    /// Whether a product may be installed at `now`
    pub fn allows(&self, product_id: &str, now: NaiveTime) -> bool {
        self.exceptions.contains(product_id) || self.contains(now)
    }
}

impl fmt::Display for InstallationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Window test supporting windows that cross midnight
pub fn in_installation_window(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start <= end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| {
        Error::ConfigError(format!(
            "Invalid installation window time '{value}', expected HH:MM: {e}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_window_crossing_midnight() {
        let window = InstallationWindow::parse("22:00", "06:00", ["firefox"]).unwrap();
        assert!(window.contains(t(23, 0)));
        assert!(window.contains(t(3, 30)));
        assert!(window.contains(t(6, 0)));
        assert!(!window.contains(t(12, 0)));
        assert!(!window.allows("hwaudit", t(12, 0)));
        assert!(window.allows("firefox", t(12, 0)));
    }

    #[test]
    fn test_window_same_day() {
        let window = InstallationWindow::parse("06:30", "18:00", Vec::<String>::new()).unwrap();
        assert!(window.contains(t(6, 30)));
        assert!(window.contains(t(12, 0)));
        assert!(!window.contains(t(18, 1)));
        assert!(!window.contains(t(23, 0)));
    }

    #[test]
    fn test_invalid_time_rejected() {
        assert!(InstallationWindow::parse("25:00", "06:00", Vec::<String>::new()).is_err());
        assert!(InstallationWindow::parse("morning", "06:00", Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_display() {
        let window = InstallationWindow::new(t(22, 0), t(6, 0));
        assert_eq!(window.to_string(), "22:00-06:00");
    }
}
