// ABOUTME: Watermark and sync token model for timestamp-based change polling
// ABOUTME: Watermarks are UTC generalized time values truncated to whole seconds

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generalized time without fraction (`20240101000000Z`).
pub const WATERMARK_FORMAT: &str = "%Y%m%d%H%M%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatermarkError {
    #[error("synchronization token is not a string, it is {0}")]
    NotText(&'static str),
    #[error("synchronization token {0:?} is not a generalized time value")]
    NotGeneralizedTime(String),
}

/// A checkpoint meaning "everything changed before this second has been seen".
///
/// Always whole-second UTC. The textual form is fixed width and zero padded,
/// so lexical order and chronological order agree and the value can be used
/// directly as a filter assertion against `modifyTimestamp`/`createTimestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// Watermark for the given instant, sub-second fraction dropped.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant.trunc_subsecs(0))
    }

    pub fn now(clock: &impl Clock) -> Self {
        Self::at(clock.now())
    }

    /// Parses and normalizes generalized time.
    ///
    /// Fractions are dropped and numeric offsets converted to UTC, so
    /// `20240101013000.5+0130` becomes `20240101000000Z`.
    pub fn parse(text: &str) -> Result<Self, WatermarkError> {
        parse_generalized_time(text)
            .map(Self::at)
            .ok_or_else(|| WatermarkError::NotGeneralizedTime(text.to_string()))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(WATERMARK_FORMAT))
    }
}

impl TryFrom<String> for Watermark {
    type Error = WatermarkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Watermark> for String {
    fn from(value: Watermark) -> Self {
        value.to_string()
    }
}

/// Present instant as a watermark.
pub fn current_watermark() -> Watermark {
    Watermark::now(&SystemClock)
}

/// Resume token as handed over by callers.
///
/// Only [`SyncToken::Text`] holding generalized time is meaningful to the
/// timestamp strategy; other variants exist because tokens are opaque to the
/// caller and may come from a different strategy's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncToken {
    Text(String),
    Integer(i64),
    Binary(Vec<u8>),
}

impl SyncToken {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncToken::Text(_) => "text",
            SyncToken::Integer(_) => "integer",
            SyncToken::Binary(_) => "binary",
        }
    }

    pub fn watermark(&self) -> Result<Watermark, WatermarkError> {
        match self {
            SyncToken::Text(text) => Watermark::parse(text),
            other => Err(WatermarkError::NotText(other.kind())),
        }
    }
}

impl From<Watermark> for SyncToken {
    fn from(value: Watermark) -> Self {
        SyncToken::Text(value.to_string())
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncToken::Text(text) => write!(f, "{text}"),
            SyncToken::Integer(value) => write!(f, "{value}"),
            SyncToken::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Source of "now" for watermark capture.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock, second resolution.
#[derive(Debug, Default)]
pub struct FixedClock {
    unix_secs: AtomicI64,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            unix_secs: AtomicI64::new(at.timestamp()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.unix_secs.store(at.timestamp(), Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.unix_secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.unix_secs.load(Ordering::SeqCst), 0).unwrap_or_default()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// `YYYYMMDDHH[MM[SS]][(.|,)fraction](Z|+HH[MM]|-HH[MM])`.
// sqlite-directory's filter keeps its own copy since the core builds without
// that crate. The two must agree on every value either accepts.
fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let (body, offset_secs) = if let Some(body) = value.strip_suffix('Z') {
        (body, 0)
    } else {
        let idx = value.rfind(['+', '-'])?;
        let (body, zone) = value.split_at(idx);
        (body, parse_offset(zone)?)
    };

    let (digits, fraction) = match body.find(['.', ',']) {
        Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
        None => (body, None),
    };
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    if !matches!(digits.len(), 10 | 12 | 14) || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let two = |start: usize| -> Option<u32> {
        digits
            .get(start..start + 2)
            .map_or(Some(0), |part| part.parse().ok())
    };
    let year: i32 = digits[..4].parse().ok()?;
    let local = NaiveDate::from_ymd_opt(year, two(4)?, two(6)?)?
        .and_hms_opt(two(8)?, two(10)?, two(12)?)?;
    let utc = local - chrono::Duration::seconds(offset_secs);
    Some(Utc.from_utc_datetime(&utc))
}

fn parse_offset(zone: &str) -> Option<i64> {
    let sign = match zone.chars().next()? {
        '+' => 1,
        '-' => -1,
        _ => return None,
    };
    let digits = &zone[1..];
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes): (i64, i64) = match digits.len() {
        2 => (digits.parse().ok()?, 0),
        4 => (digits[..2].parse().ok()?, digits[2..].parse().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}
