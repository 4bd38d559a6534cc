// ABOUTME: Query builder - turns a watermark into the change search filter
// ABOUTME: Matches entries whose modifyTimestamp OR createTimestamp is at/after the watermark

use std::fmt;

use super::error::SyncError;
use super::token::{Clock, SyncToken, Watermark};
use crate::directory::{Entry, CREATE_TIMESTAMP, MODIFY_TIMESTAMP};

/// `(|(modifyTimestamp>=W)(createTimestamp>=W))`
///
/// Both markers are needed: an entry that was created but never modified may
/// carry only `createTimestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeQuery {
    watermark: Watermark,
}

impl ChangeQuery {
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Evaluates the filter locally, boundary inclusive.
    ///
    /// Marker values are normalized before comparing, so offsets and fractions
    /// compare chronologically. A value that is not generalized time falls
    /// back to the plain string comparison a directory server would apply.
    pub fn matches(&self, entry: &Entry) -> bool {
        [MODIFY_TIMESTAMP, CREATE_TIMESTAMP].iter().any(|marker| {
            entry
                .values(marker)
                .iter()
                .any(|value| self.marker_at_or_after(value))
        })
    }

    fn marker_at_or_after(&self, value: &str) -> bool {
        match Watermark::parse(value) {
            Ok(marker) => marker >= self.watermark,
            Err(_) => value >= self.watermark.to_string().as_str(),
        }
    }
}

impl fmt::Display for ChangeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.watermark.to_string();
        write!(
            f,
            "(|({MODIFY_TIMESTAMP}>={value})({CREATE_TIMESTAMP}>={value}))"
        )
    }
}

pub fn build_change_filter(watermark: Watermark) -> ChangeQuery {
    ChangeQuery { watermark }
}

/// Lower bound for a scan. No token means "changes since now", which finds
/// nothing on the first call and only establishes a resume point.
pub fn resolve_since(
    token: Option<&SyncToken>,
    clock: &impl Clock,
) -> Result<Watermark, SyncError> {
    match token {
        Some(token) => Ok(token.watermark()?),
        None => Ok(Watermark::now(clock)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::token::FixedClock;
    use chrono::{TimeZone, Utc};

    fn watermark(text: &str) -> Watermark {
        Watermark::parse(text).unwrap()
    }

    #[test]
    fn renders_or_of_both_markers() {
        let query = build_change_filter(watermark("20240101000000Z"));
        assert_eq!(
            query.to_string(),
            "(|(modifyTimestamp>=20240101000000Z)(createTimestamp>=20240101000000Z))"
        );
    }

    #[test]
    fn boundary_is_inclusive() {
        let query = build_change_filter(watermark("20240101000000Z"));
        let at_boundary =
            Entry::new("uid=a").with_attribute("modifyTimestamp", ["20240101000000Z"]);
        assert!(query.matches(&at_boundary));
    }

    #[test]
    fn older_markers_do_not_match() {
        let query = build_change_filter(watermark("20240101000000Z"));
        let older = Entry::new("uid=b")
            .with_attribute("modifyTimestamp", ["20231231235959Z"])
            .with_attribute("createTimestamp", ["19991231235959Z"]);
        assert!(!query.matches(&older));
        assert!(!query.matches(&Entry::new("uid=none")));
    }

    #[test]
    fn creation_marker_alone_is_enough() {
        let query = build_change_filter(watermark("20240101000000Z"));
        let created = Entry::new("uid=c").with_attribute("createTimestamp", ["20240101000001Z"]);
        assert!(query.matches(&created));
    }

    #[test]
    fn markers_are_normalized_before_comparison() {
        let query = build_change_filter(watermark("20240101000000Z"));
        let offset = Entry::new("uid=d").with_attribute("modifyTimestamp", ["20240101003000+0030"]);
        assert!(query.matches(&offset));
        let earlier_offset =
            Entry::new("uid=e").with_attribute("modifyTimestamp", ["20240101003000+0100"]);
        assert!(!query.matches(&earlier_offset));
    }

    #[test]
    fn resolve_since_uses_clock_without_token() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        assert_eq!(
            resolve_since(None, &clock).unwrap().to_string(),
            "20240601120000Z"
        );
        let token = SyncToken::Text("20240101000000Z".to_string());
        assert_eq!(
            resolve_since(Some(&token), &clock).unwrap().to_string(),
            "20240101000000Z"
        );
        assert!(matches!(
            resolve_since(Some(&SyncToken::Integer(1)), &clock),
            Err(SyncError::InvalidArgument(_))
        ));
    }
}
