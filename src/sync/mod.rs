// ABOUTME: Timestamp-watermark change polling - scanner, watermark advancer, checkpoints
// ABOUTME: Finds entries created or modified since a watermark and emits change events

pub mod advancer;
pub mod daemon;
pub mod error;
pub mod filter;
pub mod handler;
pub mod observer;
pub mod predicate;
pub mod scanner;
pub mod state;
pub mod token;

pub use advancer::{Capture, CyclePhase, WatermarkAdvancer};
pub use daemon::{DaemonConfig, SyncDaemon, SyncStats};
pub use error::SyncError;
pub use filter::{build_change_filter, resolve_since, ChangeQuery};
pub use handler::{
    ChangeEvent, ChangeHandler, ChangeKind, CollectingHandler, EventFn, FinalWatermarkHandler,
    JsonLinesHandler,
};
pub use observer::{ScanObserver, TracingObserver};
pub use predicate::{last_changer, AcceptancePredicate, ChangerExclusion};
pub use scanner::{ModifyTimestampSync, ScanSummary, SyncOptions, SyncSettings};
pub use state::{CheckpointState, ClassCheckpoint};
pub use token::{
    current_watermark, Clock, FixedClock, SyncToken, SystemClock, Watermark, WatermarkError,
};
