// ABOUTME: Injected observability hooks for change scans
// ABOUTME: TracingObserver maps scan milestones onto structured tracing events

use tracing::{debug, info, warn};

use super::error::SyncError;
use super::scanner::ScanSummary;
use super::token::Watermark;
use crate::schema::ObjectClass;

/// Scan milestones. Every hook defaults to a no-op.
pub trait ScanObserver {
    fn search_started(
        &self,
        _object_class: &ObjectClass,
        _base: &str,
        _filter: &str,
        _attributes: &[String],
    ) {
    }

    fn clock_regressed(&self, _observed: Watermark, _committed: Watermark) {}

    fn entry_found(&self, _dn: &str) {}

    fn entry_rejected(&self, _dn: &str) {}

    fn event_delivered(&self, _dn: &str, _token: Watermark) {}

    fn scan_completed(&self, _summary: &ScanSummary) {}

    fn scan_failed(&self, _object_class: &ObjectClass, _filter: &str, _error: &SyncError) {}
}

impl ScanObserver for () {}

impl<O: ScanObserver + ?Sized> ScanObserver for &O {
    fn search_started(
        &self,
        object_class: &ObjectClass,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) {
        (**self).search_started(object_class, base, filter, attributes)
    }

    fn clock_regressed(&self, observed: Watermark, committed: Watermark) {
        (**self).clock_regressed(observed, committed)
    }

    fn entry_found(&self, dn: &str) {
        (**self).entry_found(dn)
    }

    fn entry_rejected(&self, dn: &str) {
        (**self).entry_rejected(dn)
    }

    fn event_delivered(&self, dn: &str, token: Watermark) {
        (**self).event_delivered(dn, token)
    }

    fn scan_completed(&self, summary: &ScanSummary) {
        (**self).scan_completed(summary)
    }

    fn scan_failed(&self, object_class: &ObjectClass, filter: &str, error: &SyncError) {
        (**self).scan_failed(object_class, filter, error)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ScanObserver for TracingObserver {
    fn search_started(
        &self,
        object_class: &ObjectClass,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) {
        debug!(
            object_class = %object_class,
            base,
            filter,
            attributes = ?attributes,
            "searching for changes"
        );
    }

    fn clock_regressed(&self, observed: Watermark, committed: Watermark) {
        warn!(
            observed = %observed,
            committed = %committed,
            "clock is behind the committed watermark, keeping the committed value"
        );
    }

    fn entry_found(&self, dn: &str) {
        debug!(dn, "found entry");
    }

    fn entry_rejected(&self, dn: &str) {
        debug!(dn, "entry not acceptable for synchronization");
    }

    fn event_delivered(&self, dn: &str, token: Watermark) {
        debug!(dn, token = %token, "delivered change event");
    }

    fn scan_completed(&self, summary: &ScanSummary) {
        info!(
            object_class = %summary.object_class,
            base = %summary.base,
            filter = %summary.filter,
            found = summary.found,
            delivered = summary.delivered,
            token = %summary.resume,
            "change scan completed"
        );
    }

    fn scan_failed(&self, object_class: &ObjectClass, filter: &str, error: &SyncError) {
        warn!(
            object_class = %object_class,
            filter,
            retryable = error.is_retryable(),
            "change scan failed: {}",
            error
        );
    }
}
