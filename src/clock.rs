//! Time & window clock.
//!
//! Period boundary math plus the ET-localised calendar fragments used to
//! build hourly/daily market slugs. Slug rendering must use
//! America/New_York: a server running in UTC would otherwise request a
//! market that does not yet exist.

use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::America::New_York;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn period_secs(&self) -> i64 {
        match self {
            Timeframe::M15 => 15 * 60,
            Timeframe::H1 => 3600,
            Timeframe::H4 => 4 * 3600,
            Timeframe::D1 => 24 * 3600,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "daily",
        }
    }

    /// Only 15-minute markets carry a price-dependent taker fee.
    pub fn has_fees(&self) -> bool {
        matches!(self, Timeframe::M15)
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "15m" => Ok(Timeframe::M15),
            "1h" | "60m" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" | "daily" => Ok(Timeframe::D1),
            other => bail!("unknown timeframe: {other}"),
        }
    }
}

/// Floor of `now_unix` to the period length.
pub fn current_period_start(now_unix: i64, timeframe: Timeframe) -> i64 {
    let period = timeframe.period_secs();
    now_unix - now_unix.rem_euclid(period)
}

/// Start of the period `offset` windows after the current one.
pub fn period_start_at_offset(now_unix: i64, timeframe: Timeframe, offset: u8) -> i64 {
    current_period_start(now_unix, timeframe) + offset as i64 * timeframe.period_secs()
}

/// Milliseconds until the next period boundary. Strictly positive: exactly
/// on a boundary means one full period ahead.
pub fn ms_until_next_boundary(now_ms: i64, timeframe: Timeframe) -> u64 {
    let period_ms = timeframe.period_secs() * 1000;
    let rem = now_ms.rem_euclid(period_ms);
    (period_ms - rem) as u64
}

/// ET calendar fragments of a period start, for slug construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlugFragments {
    pub month_name: &'static str,
    pub day: u32,
    pub hour12: u32,
    pub am_pm: &'static str,
}

pub fn slug_fragments(period_ts: i64) -> SlugFragments {
    let et = DateTime::from_timestamp(period_ts, 0)
        .unwrap_or_default()
        .with_timezone(&New_York);

    let (is_pm, hour12) = et.hour12();
    SlugFragments {
        month_name: month_name(et.month()),
        day: et.day(),
        hour12,
        am_pm: if is_pm { "pm" } else { "am" },
    }
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "january",
        2 => "february",
        3 => "march",
        4 => "april",
        5 => "may",
        6 => "june",
        7 => "july",
        8 => "august",
        9 => "september",
        10 => "october",
        11 => "november",
        _ => "december",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn period_start_floors() {
        // 12:07:33 floors to 12:00 for 15m.
        let now = Utc.with_ymd_and_hms(2024, 7, 15, 12, 7, 33).unwrap();
        let start = current_period_start(now.timestamp(), Timeframe::M15);
        let expect = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        assert_eq!(start, expect.timestamp());

        let start_h = current_period_start(now.timestamp(), Timeframe::H1);
        assert_eq!(start_h, expect.timestamp());
    }

    #[test]
    fn offset_walks_forward() {
        let now = Utc.with_ymd_and_hms(2024, 7, 15, 12, 1, 0).unwrap();
        let s0 = period_start_at_offset(now.timestamp(), Timeframe::M15, 0);
        let s1 = period_start_at_offset(now.timestamp(), Timeframe::M15, 1);
        assert_eq!(s1 - s0, 900);
    }

    #[test]
    fn boundary_returns_full_period() {
        let boundary = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let ms = ms_until_next_boundary(boundary.timestamp_millis(), Timeframe::M15);
        assert_eq!(ms, 15 * 60 * 1000);

        // One ms past the boundary: one full period minus 1ms.
        let ms = ms_until_next_boundary(boundary.timestamp_millis() + 1, Timeframe::M15);
        assert_eq!(ms, 15 * 60 * 1000 - 1);
        assert!(ms > 0);
    }

    #[test]
    fn slug_fragments_are_et_with_dst() {
        // January: EST (UTC-5). 18:00 UTC = 1pm ET.
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 18, 0, 0).unwrap();
        let f = slug_fragments(winter.timestamp());
        assert_eq!(f.month_name, "january");
        assert_eq!(f.day, 15);
        assert_eq!(f.hour12, 1);
        assert_eq!(f.am_pm, "pm");

        // July: EDT (UTC-4). 18:00 UTC = 2pm ET.
        let summer = Utc.with_ymd_and_hms(2024, 7, 15, 18, 0, 0).unwrap();
        let f = slug_fragments(summer.timestamp());
        assert_eq!(f.month_name, "july");
        assert_eq!(f.hour12, 2);
        assert_eq!(f.am_pm, "pm");
    }

    #[test]
    fn slug_fragments_cross_date_line() {
        // 03:00 UTC in July = 11pm ET the previous day.
        let t = Utc.with_ymd_and_hms(2024, 7, 16, 3, 0, 0).unwrap();
        let f = slug_fragments(t.timestamp());
        assert_eq!(f.day, 15);
        assert_eq!(f.hour12, 11);
        assert_eq!(f.am_pm, "pm");
    }

    #[test]
    fn midnight_and_noon_render_as_12() {
        // 04:00 UTC in July = midnight ET.
        let t = Utc.with_ymd_and_hms(2024, 7, 16, 4, 0, 0).unwrap();
        let f = slug_fragments(t.timestamp());
        assert_eq!(f.hour12, 12);
        assert_eq!(f.am_pm, "am");

        // 16:00 UTC in July = noon ET.
        let t = Utc.with_ymd_and_hms(2024, 7, 16, 16, 0, 0).unwrap();
        let f = slug_fragments(t.timestamp());
        assert_eq!(f.hour12, 12);
        assert_eq!(f.am_pm, "pm");
    }
}
