//! Run orchestration.
//!
//! One run is: detect tools, startup checks, open the store, scan, diff,
//! record observations, resolve, execute, flush. Every fatal condition is
//! detected before the first mutation reaches the store.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::Config;
use crate::error::EngineError;
use crate::interrupt::{InterruptController, Phase};
use crate::plan::{diff, items_from_records, Change, DiffOptions};
use crate::playlist::{convert_tree, PlaylistContext, PlaylistReport};
use crate::pool::{spawn_periodic_flush, WorkerPool};
use crate::resolve::{resolve, settle_mirror_paths, Lane, ResolveOptions};
use crate::scan::{is_hidden, Item, Scanner};
use crate::startup::{check_playlists, run_startup_checks};
use crate::store::{FingerprintStore, Record};
use crate::summary::{Outcome, RunSummary};
use crate::tools::{AudioTools, ExternalTools};
use crate::worker::WorkerContext;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub lane: Lane,
    /// Re-run the native action of every item.
    pub force_all: bool,
    /// Re-run items whose stamp names an older tool version.
    pub tool_update: bool,
    /// Take the stored records as the current tree instead of walking it.
    pub skip_scan: bool,
    /// Plan and report without changing anything.
    pub dry_run: bool,
}

impl RunOptions {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            force_all: false,
            tool_update: false,
            skip_scan: false,
            dry_run: false,
        }
    }
}

/// A store record as shown by `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedRecord {
    pub key: String,
    #[serde(flatten)]
    pub record: Record,
}

/// The sync engine for one library.
///
/// An engine drives a single run: its interrupt controller only moves
/// forward, so a finished or interrupted engine is not reused.
pub struct Engine {
    config: Config,
    tools: Arc<dyn AudioTools>,
    controller: InterruptController,
    concurrency_plan: ConcurrencyPlan,
}

impl Engine {
    pub fn new(config: Config, tools: Arc<dyn AudioTools>) -> Self {
        let concurrency_plan = derive_plan(&config);
        Self {
            config,
            tools,
            controller: InterruptController::new(),
            concurrency_plan,
        }
    }

    /// Engine backed by the installed command-line tools.
    pub fn with_external_tools(config: Config) -> Self {
        let tools = Arc::new(ExternalTools::from_config(&config));
        Self::new(config, tools)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn controller(&self) -> &InterruptController {
        &self.controller
    }

    /// Execute one lane over the library.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary, EngineError> {
        let cfg = &self.config;
        let lane = options.lane;
        info!(lane = lane.as_str(), dry_run = options.dry_run, "Starting run");

        let versions = self.tools.detect_versions().await;
        run_startup_checks(cfg, lane, &versions, num_cpus::get() as u32)?;

        let store = Arc::new(FingerprintStore::open(&cfg.library.status_file)?);
        if !options.dry_run {
            if let Some(backup) = store.backup()? {
                debug!(path = %backup.display(), "Backed up fingerprint store");
            }
        }

        let previous = store.snapshot();
        let items = if options.skip_scan {
            info!("Skipping scan; using stored records");
            items_from_records(&cfg.library.source, &previous)
        } else {
            self.scan().await?
        };

        let plan = diff(
            &previous,
            items,
            DiffOptions {
                testing_requested: lane.testing(),
            },
        );
        info!(
            new = plan.count(Change::New),
            changed = plan.count(Change::Changed),
            removed = plan.count(Change::Removed),
            unchanged = plan.count(Change::Unchanged),
            "Scan complete"
        );

        if !options.dry_run {
            store.apply(plan.observations())?;
        }

        let resolve_options = ResolveOptions {
            lane,
            force_all: options.force_all,
            tool_update: options.tool_update,
            mirror_method: cfg.mirror.method,
        };
        let (actions, conflicts) = settle_mirror_paths(lane, resolve(&plan, &resolve_options, &versions));

        let mut summary = RunSummary::new(lane, options.dry_run);
        for planned in &actions {
            summary.plan(planned);
        }
        for conflict in conflicts {
            let planned = &conflict.planned;
            warn!(key = %planned.key, claimed_by = %conflict.claimed_by, "Mirror path already in use");
            summary.plan(planned);
            summary.record(
                &planned.key,
                planned.action,
                Outcome::Failed(format!("mirror path is already used by {}", conflict.claimed_by)),
            );
        }
        let work: Vec<_> = actions.into_iter().filter(|a| a.action.is_work()).collect();

        if options.dry_run {
            for planned in &work {
                info!(key = %planned.key, action = planned.action.as_str(), "Would run");
            }
            summary.log();
            return Ok(summary);
        }

        if lane == Lane::Mirror && !work.is_empty() {
            std::fs::create_dir_all(&cfg.library.mirror).map_err(|source| EngineError::Io {
                path: cfg.library.mirror.clone(),
                source,
            })?;
        }

        let ctx = Arc::new(WorkerContext {
            tools: self.tools.clone(),
            versions,
            store: store.clone(),
            source_root: cfg.library.source.clone(),
            mirror_root: cfg.library.mirror.clone(),
            mirror_method: cfg.mirror.method,
            fingerprint_kind: cfg.fingerprint.kind,
            allow_modification: cfg.library.allow_modification,
        });

        let stop_flushing = CancellationToken::new();
        let flusher = (cfg.workers.flush_interval_secs > 0).then(|| {
            spawn_periodic_flush(
                store.clone(),
                Duration::from_secs(cfg.workers.flush_interval_secs),
                stop_flushing.clone(),
            )
        });

        info!(actions = work.len(), workers = self.concurrency_plan.workers, "Executing");
        WorkerPool::new(self.concurrency_plan)
            .execute(work, ctx, &self.controller, &mut summary)
            .await;

        stop_flushing.cancel();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }

        self.controller.advance(Phase::Flushing);
        let flushing = store.clone();
        let flushed = tokio::task::spawn_blocking(move || flushing.flush())
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?;
        store.seal();
        self.controller.advance(Phase::Stopped);
        flushed?;

        summary.interrupted = self.controller.is_interrupted();
        summary.log();
        Ok(summary)
    }

    /// Walk the source tree on the blocking pool.
    async fn scan(&self) -> Result<Vec<Item>, EngineError> {
        let cfg = &self.config;
        let mut scanner = Scanner::new(cfg.library.source.clone(), cfg.fingerprint.kind);
        if cfg.library.ignore_hidden {
            scanner = scanner.ignore(is_hidden);
        }
        info!(root = %cfg.library.source.display(), kind = %cfg.fingerprint.kind, "Scanning");

        let token = self.controller.token();
        let items = tokio::task::spawn_blocking(move || scanner.collect(&token))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        Ok(items)
    }

    /// Stored records in key order; with `orphan_only`, only those whose
    /// source file no longer exists.
    pub fn list(&self, orphan_only: bool) -> Result<Vec<ListedRecord>, EngineError> {
        let source = &self.config.library.source;
        let records = FingerprintStore::load(&self.config.library.status_file)?;
        Ok(records
            .into_iter()
            .filter(|(key, _)| !orphan_only || !source.join(key).is_file())
            .map(|(key, record)| ListedRecord { key, record })
            .collect())
    }

    /// Rewrite the library playlists into the portable playlist directory.
    pub fn convert_playlists(&self, dry_run: bool) -> Result<PlaylistReport, EngineError> {
        let cfg = &self.config;
        check_playlists(cfg)?;
        let (Some(library), Some(portable)) = (&cfg.library.playlists, &cfg.library.portable_playlists) else {
            return Err(crate::startup::StartupError::PlaylistsNotConfigured.into());
        };
        let records = FingerprintStore::load(&cfg.library.status_file)?;
        let ctx = PlaylistContext {
            source_root: &cfg.library.source,
            mirror_root: &cfg.library.mirror,
            records: &records,
        };
        let report = convert_tree(library, portable, &ctx, dry_run)?;
        info!(
            converted = report.converted,
            failed = report.failed.len(),
            skipped = report.skipped,
            dry_run,
            "Playlists converted"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{content_hash, FingerprintKind};
    use crate::resolve::Action;
    use crate::tools::fake::{FakeTools, REENCODED_MARK};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.library.source = dir.path().join("library");
        cfg.library.mirror = dir.path().join("mirror");
        cfg.library.status_file = dir.path().join("status.toml");
        cfg.fingerprint.kind = FingerprintKind::ContentHash;
        cfg.workers.threads = 1;
        fs::create_dir_all(&cfg.library.source).unwrap();
        (dir, cfg)
    }

    fn put(cfg: &Config, key: &str, contents: &[u8]) {
        let path = cfg.library.source.join(key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    async fn run_with(cfg: &Config, tools: FakeTools, options: RunOptions) -> RunSummary {
        Engine::new(cfg.clone(), Arc::new(tools)).run(options).await.unwrap()
    }

    async fn mirror(cfg: &Config) -> RunSummary {
        run_with(cfg, FakeTools::new(), RunOptions::new(Lane::Mirror)).await
    }

    fn stored(cfg: &Config) -> crate::store::Records {
        FingerprintStore::load(&cfg.library.status_file).unwrap()
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        put(&cfg, "b.txt", b"text");

        let first = mirror(&cfg).await;
        assert_eq!(first.counts(Action::Transcode).succeeded, 1);
        assert_eq!(first.counts(Action::MirrorCopy).succeeded, 1);

        let records = stored(&cfg);
        assert_eq!(records.len(), 2);
        let h1 = content_hash(&cfg.library.source.join("a.flac")).unwrap();
        let h2 = content_hash(&cfg.library.source.join("b.txt")).unwrap();
        assert_eq!(records["a.flac"].fingerprint, h1);
        assert_eq!(records["b.txt"].fingerprint, h2);
        assert_eq!(fs::read(cfg.library.mirror.join("a.opus")).unwrap(), b"opus:pcm");
        assert_eq!(fs::read(cfg.library.mirror.join("b.txt")).unwrap(), b"text");

        let second = mirror(&cfg).await;
        assert_eq!(second.total(|c| c.planned), 0);
        assert_eq!(second.total(|c| c.skipped), 2);
    }

    #[tokio::test]
    async fn test_second_run_is_idle_in_every_lane() {
        let (_dir, mut cfg) = setup();
        cfg.library.allow_modification = true;
        put(&cfg, "A/01.flac", b"one");
        put(&cfg, "A/02.flac", b"two");
        put(&cfg, "A/cover.jpg", b"jpg");

        for lane in [Lane::Scan { testing: true }, Lane::Reencode, Lane::Mirror] {
            let first = run_with(&cfg, FakeTools::new(), RunOptions::new(lane)).await;
            assert!(!first.has_failures());
            let second = run_with(&cfg, FakeTools::new(), RunOptions::new(lane)).await;
            assert_eq!(second.total(|c| c.planned), 0, "lane {}", lane.as_str());
        }
    }

    #[tokio::test]
    async fn test_fingerprint_kind_switch_invalidates_everything() {
        let (_dir, mut cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        put(&cfg, "b.txt", b"text");
        mirror(&cfg).await;

        cfg.fingerprint.kind = FingerprintKind::Mtime;
        let summary = mirror(&cfg).await;
        assert_eq!(summary.counts(Action::Transcode).planned, 1);
        assert_eq!(summary.counts(Action::MirrorCopy).planned, 1);
        assert_eq!(summary.total(|c| c.skipped), 0);
        assert!(stored(&cfg)
            .values()
            .all(|r| r.fingerprint_kind == FingerprintKind::Mtime));
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_remaining_items() {
        let (_dir, cfg) = setup();
        for name in ["a.flac", "b.flac", "c.flac"] {
            put(&cfg, name, name.as_bytes());
        }
        let mut tools = FakeTools::new();
        tools.stall.insert("b.flac".into());
        let tools = Arc::new(tools);
        let engine = Engine::new(cfg.clone(), tools.clone());

        // Interrupt once the single worker has moved past a.flac
        let controller = engine.controller().clone();
        let watcher = tools.clone();
        tokio::spawn(async move {
            while watcher.count("transcode") < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            controller.request_drain();
        });

        let summary = tokio::time::timeout(Duration::from_secs(10), engine.run(RunOptions::new(Lane::Mirror)))
            .await
            .unwrap()
            .unwrap();
        assert!(summary.interrupted);
        let counts = summary.counts(Action::Transcode);
        assert_eq!((counts.succeeded, counts.interrupted), (1, 2));
        assert_eq!(engine.controller().phase(), Phase::Stopped);

        let records = stored(&cfg);
        assert!(records["a.flac"].transcode.is_some());
        assert!(records["b.flac"].transcode.is_none());
        assert!(records["c.flac"].transcode.is_none());
        assert!(!cfg.library.mirror.join("b.opus").exists());

        let resumed = mirror(&cfg).await;
        let counts = resumed.counts(Action::Transcode);
        assert_eq!((counts.planned, counts.succeeded, counts.skipped), (2, 2, 1));
    }

    #[tokio::test]
    async fn test_removed_item_is_cleaned_up() {
        let (_dir, cfg) = setup();
        put(&cfg, "Gone/a.flac", b"pcm");
        put(&cfg, "keep.txt", b"k");
        mirror(&cfg).await;
        assert!(cfg.library.mirror.join("Gone/a.opus").exists());

        fs::remove_dir_all(cfg.library.source.join("Gone")).unwrap();
        let summary = mirror(&cfg).await;

        assert_eq!(summary.counts(Action::DeleteStaleRecord).succeeded, 1);
        assert!(!stored(&cfg).contains_key("Gone/a.flac"));
        assert!(!cfg.library.mirror.join("Gone").exists());
        assert!(cfg.library.mirror.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_force_all_reruns_native_actions() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        put(&cfg, "b.txt", b"text");
        mirror(&cfg).await;

        let mut options = RunOptions::new(Lane::Mirror);
        options.force_all = true;
        let summary = run_with(&cfg, FakeTools::new(), options).await;
        assert_eq!(summary.counts(Action::Transcode).succeeded, 1);
        assert_eq!(summary.counts(Action::MirrorCopy).succeeded, 1);
    }

    #[tokio::test]
    async fn test_tool_update_reruns_stale_transcodes() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        put(&cfg, "b.txt", b"text");
        mirror(&cfg).await;

        let mut upgraded = FakeTools::new();
        upgraded.versions.transcoder = Some("opusenc opus-tools 0.3".into());
        let mut options = RunOptions::new(Lane::Mirror);
        options.tool_update = true;
        let summary = run_with(&cfg, upgraded, options).await;

        assert_eq!(summary.counts(Action::Transcode).succeeded, 1);
        assert_eq!(summary.counts(Action::MirrorCopy).skipped, 1);
        assert_eq!(
            stored(&cfg)["a.flac"].transcode.as_ref().unwrap().tool,
            "opusenc opus-tools 0.3"
        );
    }

    #[tokio::test]
    async fn test_failed_retranscode_keeps_mirror_output() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        mirror(&cfg).await;
        let out = cfg.library.mirror.join("a.opus");

        let mut upgraded = FakeTools::new();
        upgraded.versions.transcoder = Some("opusenc opus-tools 0.3".into());
        upgraded.broken.insert("a.flac".into());
        let mut options = RunOptions::new(Lane::Mirror);
        options.tool_update = true;
        let summary = run_with(&cfg, upgraded, options).await;
        assert_eq!(summary.counts(Action::Transcode).failed, 1);
        assert_eq!(fs::read(&out).unwrap(), b"opus:pcm");
        assert_eq!(
            stored(&cfg)["a.flac"].transcode.as_ref().unwrap().tool,
            "opusenc opus-tools 0.2"
        );

        let after = mirror(&cfg).await;
        assert_eq!(after.counts(Action::Transcode).planned, 0);
        assert_eq!(fs::read(&out).unwrap(), b"opus:pcm");
    }

    #[tokio::test]
    async fn test_playlist_mirrored_with_its_tracks() {
        let (_dir, cfg) = setup();
        put(&cfg, "A/song.flac", b"pcm");
        put(&cfg, "A/list.m3u", b"song.flac\n");

        let first = mirror(&cfg).await;
        assert!(!first.has_failures());
        assert!(cfg.library.mirror.join("A/song.opus").exists());
        assert_eq!(
            fs::read_to_string(cfg.library.mirror.join("A/list.m3u")).unwrap(),
            "song.opus\n"
        );

        let second = mirror(&cfg).await;
        assert_eq!(second.total(|c| c.planned), 0);
    }

    #[tokio::test]
    async fn test_sources_sharing_a_mirror_path_are_reported() {
        let (_dir, cfg) = setup();
        put(&cfg, "x.flac", b"pcm");
        put(&cfg, "x.opus", b"already opus");

        let summary = mirror(&cfg).await;
        assert_eq!(summary.counts(Action::Transcode).succeeded, 1);
        let copy = summary.counts(Action::MirrorCopy);
        assert_eq!((copy.planned, copy.failed, copy.succeeded), (1, 1, 0));
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].key, "x.opus");
        assert!(summary.failures[0].reason.contains("x.flac"));
        assert_eq!(fs::read(cfg.library.mirror.join("x.opus")).unwrap(), b"opus:pcm");
        assert!(stored(&cfg)["x.opus"].mirror.is_none());

        // Removing the loser must not take the owner's output with it
        fs::remove_file(cfg.library.source.join("x.opus")).unwrap();
        let after = mirror(&cfg).await;
        assert!(!after.has_failures());
        assert_eq!(after.counts(Action::DeleteStaleRecord).succeeded, 1);
        assert_eq!(fs::read(cfg.library.mirror.join("x.opus")).unwrap(), b"opus:pcm");
    }

    #[tokio::test]
    async fn test_failed_integrity_test_is_reported_once_and_stamped() {
        let (_dir, cfg) = setup();
        put(&cfg, "good.flac", b"g");
        put(&cfg, "bad.flac", b"b");
        let mut tools = FakeTools::new();
        tools.corrupt.insert("bad.flac".into());

        let options = RunOptions::new(Lane::Scan { testing: true });
        let summary = run_with(&cfg, tools, options).await;
        assert_eq!(summary.counts(Action::Test).failed, 1);
        assert_eq!(summary.failures[0].key, "bad.flac");
        let records = stored(&cfg);
        assert!(!records["bad.flac"].test.as_ref().unwrap().passed);
        assert!(records["good.flac"].test.as_ref().unwrap().passed);

        let again = run_with(&cfg, FakeTools::new(), options).await;
        assert_eq!(again.counts(Action::Test).planned, 0);
    }

    #[tokio::test]
    async fn test_reencode_does_not_trigger_a_new_transcode() {
        let (_dir, mut cfg) = setup();
        cfg.library.allow_modification = true;
        put(&cfg, "a.flac", b"pcm");
        mirror(&cfg).await;

        let summary = run_with(&cfg, FakeTools::new(), RunOptions::new(Lane::Reencode)).await;
        assert_eq!(summary.counts(Action::Reencode).succeeded, 1);
        let mut expected = b"pcm".to_vec();
        expected.extend_from_slice(REENCODED_MARK);
        assert_eq!(fs::read(cfg.library.source.join("a.flac")).unwrap(), expected);

        let after = mirror(&cfg).await;
        assert_eq!(after.counts(Action::Transcode).planned, 0);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        put(&cfg, "b.txt", b"text");

        let mut options = RunOptions::new(Lane::Mirror);
        options.dry_run = true;
        let tools = Arc::new(FakeTools::new());
        let summary = Engine::new(cfg.clone(), tools.clone()).run(options).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.counts(Action::Transcode).planned, 1);
        assert_eq!(summary.counts(Action::MirrorCopy).planned, 1);
        assert_eq!(summary.total(|c| c.succeeded), 0);
        assert!(tools.calls().is_empty());
        assert!(!cfg.library.status_file.exists());
        assert!(!cfg.library.mirror.exists());
    }

    #[tokio::test]
    async fn test_corrupt_store_aborts_before_any_work() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        fs::write(&cfg.library.status_file, "records = [not toml").unwrap();

        let tools = Arc::new(FakeTools::new());
        let err = Engine::new(cfg.clone(), tools.clone())
            .run(RunOptions::new(Lane::Mirror))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CorruptStore(_)));
        assert!(tools.calls().is_empty());
        assert_eq!(
            fs::read_to_string(&cfg.library.status_file).unwrap(),
            "records = [not toml"
        );
    }

    #[tokio::test]
    async fn test_missing_tool_is_fatal() {
        let (_dir, cfg) = setup();
        let mut tools = FakeTools::new();
        tools.versions.transcoder = None;
        let err = Engine::new(cfg, Arc::new(tools))
            .run(RunOptions::new(Lane::Mirror))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FatalConfig(_)));
    }

    #[tokio::test]
    async fn test_skip_scan_uses_stored_records() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        run_with(&cfg, FakeTools::new(), RunOptions::new(Lane::Scan { testing: false })).await;
        put(&cfg, "late.flac", b"new");

        let mut options = RunOptions::new(Lane::Mirror);
        options.skip_scan = true;
        let summary = run_with(&cfg, FakeTools::new(), options).await;
        assert_eq!(summary.counts(Action::Transcode).succeeded, 1);
        assert!(!stored(&cfg).contains_key("late.flac"));
    }

    #[tokio::test]
    async fn test_list_and_orphans() {
        let (_dir, cfg) = setup();
        put(&cfg, "a.flac", b"pcm");
        put(&cfg, "b.txt", b"text");
        run_with(&cfg, FakeTools::new(), RunOptions::new(Lane::Scan { testing: false })).await;
        fs::remove_file(cfg.library.source.join("b.txt")).unwrap();

        let engine = Engine::new(cfg.clone(), Arc::new(FakeTools::new()));
        let all = engine.list(false).unwrap();
        assert_eq!(
            all.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
            ["a.flac", "b.txt"]
        );
        let orphans = engine.list(true).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].key, "b.txt");

        let json = serde_json::to_value(&orphans[0]).unwrap();
        assert_eq!(json["key"], "b.txt");
        assert_eq!(json["kind"], "other");
    }

    #[tokio::test]
    async fn test_convert_playlists_after_mirror() {
        let (dir, mut cfg) = setup();
        let playlists = dir.path().join("playlists");
        fs::create_dir_all(&playlists).unwrap();
        cfg.library.playlists = Some(playlists.clone());
        cfg.library.portable_playlists = Some(dir.path().join("portable"));
        put(&cfg, "A/01.flac", b"pcm");
        mirror(&cfg).await;

        let source_track = cfg.library.source.join("A/01.flac");
        fs::write(
            playlists.join("mix.m3u"),
            format!("#EXTM3U\n{}\n", source_track.display()),
        )
        .unwrap();

        let engine = Engine::new(cfg.clone(), Arc::new(FakeTools::new()));
        let report = engine.convert_playlists(false).unwrap();
        assert_eq!(report.converted, 1);
        let converted = fs::read_to_string(dir.path().join("portable/mix.m3u")).unwrap();
        let expected = cfg.library.mirror.join("A/01.opus");
        assert_eq!(converted, format!("#EXTM3U\n{}\n", expected.display()));
        assert!(Path::new(&expected).exists());
    }
}
