// ABOUTME: Modify-timestamp change scanner - searches, filters and emits change events
// ABOUTME: Every event of a scan carries the watermark captured before the search started

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::advancer::WatermarkAdvancer;
use super::error::SyncError;
use super::filter::{build_change_filter, resolve_since};
use super::handler::{ChangeEvent, ChangeHandler, ChangeKind};
use super::observer::{ScanObserver, TracingObserver};
use super::predicate::{normalize_dn, AcceptancePredicate};
use super::token::{Clock, SyncToken, SystemClock, Watermark};
use crate::directory::{
    CursorGuard, DirectoryConnection, SearchScope, CREATE_TIMESTAMP, CREATORS_NAME,
    MODIFIERS_NAME, MODIFY_TIMESTAMP, OBJECT_CLASS,
};
use crate::schema::{ObjectClass, ObjectClassInfo, SchemaTranslator};

/// Attributes every change search asks for on top of the payload attributes.
pub const CHANGE_TRACKING_ATTRIBUTES: [&str; 5] = [
    MODIFY_TIMESTAMP,
    CREATE_TIMESTAMP,
    MODIFIERS_NAME,
    CREATORS_NAME,
    OBJECT_CLASS,
];

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Payload attributes to fetch. Overrides the descriptor's list when set.
    #[serde(default)]
    pub attributes_to_get: Option<Vec<String>>,
}

/// Where to search and whose changes to ignore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    pub base_context: String,
    #[serde(default)]
    pub modifiers_names_to_filter_out: Vec<String>,
}

impl SyncSettings {
    pub fn new(base_context: impl Into<String>) -> Self {
        Self {
            base_context: base_context.into(),
            modifiers_names_to_filter_out: Vec::new(),
        }
    }

    pub fn with_excluded_modifier(mut self, dn: impl Into<String>) -> Self {
        self.modifiers_names_to_filter_out.push(dn.into());
        self
    }

    /// Stable fingerprint of everything that decides which entries a scan
    /// delivers. Checkpoints taken under a different fingerprint are stale.
    pub fn fingerprint(&self) -> String {
        let mut excluded: Vec<String> = self
            .modifiers_names_to_filter_out
            .iter()
            .map(|dn| normalize_dn(dn))
            .collect();
        excluded.sort();
        excluded.dedup();

        let mut hasher = Sha256::new();
        hasher.update(normalize_dn(&self.base_context).as_bytes());
        hasher.update(b"#");
        for dn in excluded {
            hasher.update(dn.as_bytes());
            hasher.update(b"|");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Outcome of one successful scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub object_class: String,
    pub base: String,
    pub filter: String,
    /// Lower bound the search used.
    pub since: Watermark,
    /// Watermark carried by every event and committed as the new resume point.
    pub resume: Watermark,
    /// Entries the search returned.
    pub found: u64,
    /// Entries that passed the acceptance predicate and reached the handler.
    pub delivered: u64,
}

impl ScanSummary {
    pub fn rejected(&self) -> u64 {
        self.found - self.delivered
    }
}

#[derive(Debug, Default)]
struct ScanCounts {
    found: u64,
    delivered: u64,
}

/// Change polling over `modifyTimestamp`/`createTimestamp`.
///
/// One strategy serves every object class: descriptor resolution comes from
/// the translator, exclusion from the predicate. A scan is a single blocking
/// search; the handler runs in-line for each accepted entry, so the next entry
/// is not read until the handler returns. Callers must not run two scans for
/// the same object class at the same time.
pub struct ModifyTimestampSync<C, T, P, O = TracingObserver, K = SystemClock> {
    settings: SyncSettings,
    connection: C,
    translator: T,
    predicate: P,
    observer: O,
    clock: K,
}

impl<C, T, P> ModifyTimestampSync<C, T, P> {
    pub fn new(settings: SyncSettings, connection: C, translator: T, predicate: P) -> Self {
        Self {
            settings,
            connection,
            translator,
            predicate,
            observer: TracingObserver,
            clock: SystemClock,
        }
    }
}

impl<C, T, P, O, K> ModifyTimestampSync<C, T, P, O, K> {
    pub fn with_observer<O2>(self, observer: O2) -> ModifyTimestampSync<C, T, P, O2, K> {
        ModifyTimestampSync {
            settings: self.settings,
            connection: self.connection,
            translator: self.translator,
            predicate: self.predicate,
            observer,
            clock: self.clock,
        }
    }

    pub fn with_clock<K2>(self, clock: K2) -> ModifyTimestampSync<C, T, P, O, K2> {
        ModifyTimestampSync {
            settings: self.settings,
            connection: self.connection,
            translator: self.translator,
            predicate: self.predicate,
            observer: self.observer,
            clock,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }
}

impl<C, T, P, O, K> ModifyTimestampSync<C, T, P, O, K>
where
    C: DirectoryConnection,
    T: SchemaTranslator,
    P: AcceptancePredicate,
    O: ScanObserver,
    K: Clock,
{
    /// Token for "now"; the starting point when nothing has been synced yet.
    pub fn latest_sync_token(&self, _object_class: &ObjectClass) -> SyncToken {
        Watermark::now(&self.clock).into()
    }

    /// One-shot scan with a throwaway advancer. The handler's final-watermark
    /// capability, if present, receives the new resume point.
    pub fn sync(
        &self,
        object_class: &ObjectClass,
        from_token: Option<&SyncToken>,
        handler: &mut dyn ChangeHandler,
        options: &SyncOptions,
    ) -> Result<ScanSummary, SyncError> {
        let committed = from_token.and_then(|token| token.watermark().ok());
        let mut advancer = WatermarkAdvancer::resume_from(committed);
        self.scan(&mut advancer, object_class, from_token, handler, options)
    }

    /// Scans for entries changed at or after `since` and drives `advancer`
    /// through one polling cycle.
    ///
    /// On success the captured watermark is committed and returned in the
    /// summary. On any error nothing is committed and no final watermark is
    /// delivered; events already handed to the handler stay delivered.
    pub fn scan(
        &self,
        advancer: &mut WatermarkAdvancer,
        object_class: &ObjectClass,
        since: Option<&SyncToken>,
        handler: &mut dyn ChangeHandler,
        options: &SyncOptions,
    ) -> Result<ScanSummary, SyncError> {
        // Argument checks first; nothing below may touch the store on failure.
        let info = self.resolve_object_class(object_class)?;
        let since = resolve_since(since, &self.clock)?;
        let filter = build_change_filter(since).to_string();
        let attributes = self.attributes_to_get(info.as_ref(), options);

        let capture = advancer.capture(&self.clock)?;
        if capture.clock_regressed() {
            self.observer
                .clock_regressed(capture.observed, capture.resume);
        }
        advancer.begin_scan()?;
        self.observer.search_started(
            object_class,
            &self.settings.base_context,
            &filter,
            &attributes,
        );

        let mut counts = ScanCounts::default();
        let outcome = self
            .run_search(
                info.as_ref(),
                &filter,
                &attributes,
                capture.resume,
                handler,
                &mut counts,
            )
            .and_then(|()| match handler.final_watermark_handler() {
                Some(final_handler) => final_handler
                    .handle_final(capture.resume)
                    .map_err(|err| SyncError::handler("final watermark", err)),
                None => Ok(()),
            });

        if let Err(err) = outcome {
            advancer.abort();
            self.observer.scan_failed(object_class, &filter, &err);
            return Err(err);
        }

        let resume = advancer.complete()?;
        let summary = ScanSummary {
            object_class: object_class.to_string(),
            base: self.settings.base_context.clone(),
            filter,
            since,
            resume,
            found: counts.found,
            delivered: counts.delivered,
        };
        self.observer.scan_completed(&summary);
        Ok(summary)
    }

    fn resolve_object_class(
        &self,
        object_class: &ObjectClass,
    ) -> Result<Option<ObjectClassInfo>, SyncError> {
        match object_class {
            // Resolved per entry by the translator.
            ObjectClass::All => Ok(None),
            ObjectClass::Named(_) => self
                .translator
                .find_object_class_info(object_class)
                .map(Some)
                .ok_or_else(|| {
                    SyncError::InvalidArgument(format!(
                        "No definition for object class {object_class}"
                    ))
                }),
        }
    }

    /// Payload attributes (options, else descriptor, else `*`) plus the
    /// change-tracking and translator-required attributes, de-duplicated
    /// case-insensitively in request order.
    pub fn attributes_to_get(
        &self,
        info: Option<&ObjectClassInfo>,
        options: &SyncOptions,
    ) -> Vec<String> {
        let payload: Vec<String> = match (&options.attributes_to_get, info) {
            (Some(requested), _) if !requested.is_empty() => requested.clone(),
            (_, Some(info)) if !info.attributes.is_empty() => info.attributes.clone(),
            _ => vec!["*".to_string()],
        };
        let extra = CHANGE_TRACKING_ATTRIBUTES
            .iter()
            .map(|name| name.to_string())
            .chain(self.translator.required_attributes(info));

        let mut attributes: Vec<String> = Vec::new();
        for name in payload.into_iter().chain(extra) {
            if !attributes
                .iter()
                .any(|known| known.eq_ignore_ascii_case(&name))
            {
                attributes.push(name);
            }
        }
        attributes
    }

    fn run_search(
        &self,
        info: Option<&ObjectClassInfo>,
        filter: &str,
        attributes: &[String],
        resume: Watermark,
        handler: &mut dyn ChangeHandler,
        counts: &mut ScanCounts,
    ) -> Result<(), SyncError> {
        let cursor = self
            .connection
            .search(
                &self.settings.base_context,
                filter,
                SearchScope::Subtree,
                attributes,
            )
            .map_err(|err| SyncError::transport(filter, err))?;
        let mut cursor = CursorGuard::new(cursor);

        while let Some(entry) = cursor
            .next_entry()
            .map_err(|err| SyncError::transport(filter, err))?
        {
            counts.found += 1;
            self.observer.entry_found(&entry.dn);

            // An all-classes search also returns containers and other entries
            // no configured class describes
            let unknown = info.is_none() && !self.translator.knows_entry(&entry);
            if unknown
                || !self.predicate.accept(
                    &entry,
                    info,
                    &self.settings.modifiers_names_to_filter_out,
                )
            {
                self.observer.entry_rejected(&entry.dn);
                continue;
            }

            let object = self
                .translator
                .to_connector_object(info, &entry)
                .map_err(|source| SyncError::Translation {
                    dn: entry.dn.clone(),
                    source,
                })?;
            handler
                .handle(ChangeEvent {
                    kind: ChangeKind::CreateOrUpdate,
                    token: resume,
                    object,
                })
                .map_err(|err| SyncError::handler(&entry.dn, err))?;
            counts.delivered += 1;
            self.observer.event_delivered(&entry.dn, resume);
        }

        cursor
            .close()
            .map_err(|err| SyncError::transport(filter, err))
    }
}
