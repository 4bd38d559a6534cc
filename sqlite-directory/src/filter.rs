use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

use crate::entry::{StoredEntry, CREATE_TIMESTAMP, MODIFY_TIMESTAMP};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unexpected end of filter {0:?}")]
    UnexpectedEnd(String),
    #[error("expected {expected:?} at offset {offset} in filter {filter:?}")]
    Expected {
        expected: char,
        offset: usize,
        filter: String,
    },
    #[error("filter item {0:?} has no comparison operator")]
    MissingOperator(String),
    #[error("filter item {0:?} uses an unsupported match type")]
    Unsupported(String),
    #[error("empty filter set in {0:?}")]
    EmptySet(String),
    #[error("invalid escape sequence in value {0:?}")]
    InvalidEscape(String),
    #[error("trailing characters after filter {0:?}")]
    Trailing(String),
}

/// The subset of RFC 4515 search filters the store evaluates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Present(String),
}

impl Filter {
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let trimmed = text.trim();
        // Bare items such as `objectClass=*` are accepted without parentheses.
        let owned;
        let input = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({trimmed})");
            owned.as_str()
        };
        let mut parser = Parser { input, pos: 0 };
        let filter = parser.parse_filter()?;
        if parser.pos != input.len() {
            return Err(FilterError::Trailing(text.to_string()));
        }
        Ok(filter)
    }

    pub fn matches(&self, entry: &StoredEntry) -> bool {
        match self {
            Filter::And(items) => items.iter().all(|item| item.matches(entry)),
            Filter::Or(items) => items.iter().any(|item| item.matches(entry)),
            Filter::Not(inner) => !inner.matches(entry),
            Filter::Present(attr) => entry.values(attr).is_some(),
            Filter::Equality(attr, value) => entry
                .values(attr)
                .unwrap_or_default()
                .iter()
                .any(|candidate| compare(attr, candidate, value) == Ordering::Equal),
            Filter::GreaterOrEqual(attr, value) => entry
                .values(attr)
                .unwrap_or_default()
                .iter()
                .any(|candidate| compare(attr, candidate, value) != Ordering::Less),
            Filter::LessOrEqual(attr, value) => entry
                .values(attr)
                .unwrap_or_default()
                .iter()
                .any(|candidate| compare(attr, candidate, value) != Ordering::Greater),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) => {
                write!(f, "(&")?;
                for item in items {
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Filter::Or(items) => {
                write!(f, "(|")?;
                for item in items {
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Equality(attr, value) => write!(f, "({attr}={})", escape_value(value)),
            Filter::GreaterOrEqual(attr, value) => write!(f, "({attr}>={})", escape_value(value)),
            Filter::LessOrEqual(attr, value) => write!(f, "({attr}<={})", escape_value(value)),
            Filter::Present(attr) => write!(f, "({attr}=*)"),
        }
    }
}

/// Ordering match. Timestamps compare chronologically once both sides parse as
/// generalized time; everything else compares case-insensitively as text.
fn compare(attr: &str, candidate: &str, asserted: &str) -> Ordering {
    let is_timestamp = attr.eq_ignore_ascii_case(CREATE_TIMESTAMP)
        || attr.eq_ignore_ascii_case(MODIFY_TIMESTAMP);
    if is_timestamp {
        if let (Some(left), Some(right)) = (
            parse_generalized_time(candidate),
            parse_generalized_time(asserted),
        ) {
            return left.cmp(&right);
        }
    }
    candidate
        .to_ascii_lowercase()
        .cmp(&asserted.to_ascii_lowercase())
}

/// Parses generalized time (`YYYYMMDDHH[MM[SS]][.fraction](Z|+HHMM|-HHMM)`),
/// dropping the fraction and converting to UTC.
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let (body, offset_secs) = split_zone(value)?;
    let (digits, fraction) = match body.find(['.', ',']) {
        Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
        None => (body, None),
    };
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) || ![10, 12, 14].contains(&digits.len()) {
        return None;
    }
    let field = |start: usize| -> Option<u32> {
        match digits.get(start..start + 2) {
            Some(part) => part.parse().ok(),
            None => Some(0),
        }
    };
    let year: i32 = digits[0..4].parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, field(4)?, field(6)?)?.and_hms_opt(
        field(8)?,
        field(10)?,
        field(12)?,
    )?;
    let utc = naive - chrono::Duration::seconds(offset_secs);
    Some(Utc.from_utc_datetime(&utc))
}

fn split_zone(value: &str) -> Option<(&str, i64)> {
    if let Some(body) = value.strip_suffix('Z') {
        return Some((body, 0));
    }
    let idx = value.rfind(['+', '-'])?;
    let (body, zone) = value.split_at(idx);
    let sign = if zone.starts_with('-') { -1 } else { 1 };
    let zone = &zone[1..];
    if !zone.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes): (i64, i64) = match zone.len() {
        2 => (zone.parse().ok()?, 0),
        4 => (zone[0..2].parse().ok()?, zone[2..4].parse().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some((body, sign * (hours * 3600 + minutes * 60)))
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_value(raw: &str) -> Result<String, FilterError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' {
            let hex = raw
                .get(idx + 1..idx + 3)
                .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or_else(|| FilterError::InvalidEscape(raw.to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| FilterError::InvalidEscape(raw.to_string()))?;
            out.push(byte);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).map_err(|_| FilterError::InvalidEscape(raw.to_string()))
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn expect(&mut self, expected: char) -> Result<(), FilterError> {
        match self.peek() {
            Some(ch) if ch == expected => {
                self.pos += ch.len_utf8();
                Ok(())
            }
            Some(_) => Err(FilterError::Expected {
                expected,
                offset: self.pos,
                filter: self.input.to_string(),
            }),
            None => Err(FilterError::UnexpectedEnd(self.input.to_string())),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, FilterError> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(FilterError::UnexpectedEnd(self.input.to_string())),
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut items = Vec::new();
        while self.peek() == Some('(') {
            items.push(self.parse_filter()?);
        }
        if items.is_empty() {
            return Err(FilterError::EmptySet(self.input.to_string()));
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> Result<Filter, FilterError> {
        let rest = &self.input[self.pos..];
        let end = rest
            .find(')')
            .ok_or_else(|| FilterError::UnexpectedEnd(self.input.to_string()))?;
        let item = &rest[..end];
        self.pos += end;

        let eq = item
            .find('=')
            .ok_or_else(|| FilterError::MissingOperator(item.to_string()))?;
        let (attr, raw_value, op) = match item[..eq].chars().last() {
            Some('>') => (&item[..eq - 1], &item[eq + 1..], '>'),
            Some('<') => (&item[..eq - 1], &item[eq + 1..], '<'),
            Some('~') | Some(':') => return Err(FilterError::Unsupported(item.to_string())),
            _ => (&item[..eq], &item[eq + 1..], '='),
        };
        let attr = attr.trim();
        if attr.is_empty() {
            return Err(FilterError::MissingOperator(item.to_string()));
        }
        if op == '=' && raw_value == "*" {
            return Ok(Filter::Present(attr.to_string()));
        }
        if raw_value.contains('*') {
            return Err(FilterError::Unsupported(item.to_string()));
        }
        let value = unescape_value(raw_value)?;
        Ok(match op {
            '>' => Filter::GreaterOrEqual(attr.to_string(), value),
            '<' => Filter::LessOrEqual(attr.to_string(), value),
            _ => Filter::Equality(attr.to_string(), value),
        })
    }
}
