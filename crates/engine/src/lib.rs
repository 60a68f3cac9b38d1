//! tunemirror
//!
//! Incremental sync engine that keeps a portable Opus mirror of a FLAC
//! library, driven by a persisted fingerprint store.

pub mod concurrency;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod interrupt;
pub mod mirror_ops;
pub mod plan;
pub mod playlist;
pub mod pool;
pub mod resolve;
pub mod scan;
pub mod startup;
pub mod store;
pub mod summary;
pub mod tools;
pub mod worker;

pub use tunemirror_config as config;
pub use tunemirror_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use engine::{Engine, ListedRecord, RunOptions};
pub use error::EngineError;
pub use fingerprint::{Fingerprint, FingerprintKind};
pub use interrupt::{InterruptController, Phase, ABORT_EXIT_CODE};
pub use mirror_ops::MirrorError;
pub use plan::{diff, Change, DiffOptions, PlanEntry, ReconciliationPlan};
pub use playlist::{PlaylistError, PlaylistReport};
pub use pool::WorkerPool;
pub use resolve::{
    resolve, settle_mirror_paths, Action, Interruption, Lane, PathConflict, PlannedAction, ResolveOptions,
};
pub use scan::{Item, ItemKind, ScanError, Scanner};
pub use startup::{run_startup_checks, StartupError};
pub use store::{FingerprintStore, Mutation, Record, Records, StampUpdate, StoreError};
pub use summary::{ActionCounts, Failure, Outcome, RunSummary};
pub use tools::{AudioTools, ExternalTools, TestOutcome, ToolError, ToolVersions, Transcoder};
pub use worker::{ActionError, WorkerContext};
