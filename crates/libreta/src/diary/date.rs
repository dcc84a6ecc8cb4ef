//! 日記の日付の計算。

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use regex::Regex;
use thiserror::Error;

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}$").expect("ISO date pattern is valid")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateError {
    #[error("'{0}' is not in YYYY-MM-DD format")]
    Malformed(String),
    #[error("'{0}' is not a calendar date")]
    OutOfRange(String),
}

/// 送信時刻をユーザーのタイムゾーンでの日付に変換する。
pub fn today_for(tz: Tz, sent_at: DateTime<Utc>) -> NaiveDate {
    sent_at.with_timezone(&tz).date_naive()
}

/// 送信時刻の 24 時間前の、ユーザーのタイムゾーンでの日付。
///
/// 暦ではなく時刻で引き算するため、夏時間の切り替え前後では
/// 暦の前日と一致しないことがある。
pub fn yesterday_for(tz: Tz, sent_at: DateTime<Utc>) -> NaiveDate {
    let local = sent_at.with_timezone(&tz);
    (local - TimeDelta::hours(24)).date_naive()
}

/// `YYYY-MM-DD` 形式の日付だけを受け付ける。
pub fn parse_custom_date(text: &str) -> Result<NaiveDate, DateError> {
    if !ISO_DATE.is_match(text) {
        return Err(DateError::Malformed(text.to_string()));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| DateError::OutOfRange(text.to_string()))
}
