//! Execution of a single resolved action.
//!
//! A worker performs the action's file or tool work and returns the store
//! mutation describing it. It never touches the store itself; the pool
//! applies the mutation as soon as the action succeeds.

use crate::config::MirrorMethod;
use crate::fingerprint::{Fingerprint, FingerprintKind};
use crate::mirror_ops::{self, MirrorError};
use crate::playlist::{self, PlaylistContext, PlaylistError};
use crate::resolve::{Action, PlannedAction};
use crate::scan::Item;
use crate::store::{FingerprintStore, Mutation, StampUpdate};
use crate::tools::{AudioTools, TestOutcome, ToolError, ToolVersions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why one item's action failed. Never fatal for the run.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    ExternalTool(#[from] ToolError),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no {0} version detected")]
    ToolUnavailable(&'static str),

    #[error("library modification is not allowed")]
    ModificationNotAllowed,

    #[error("action has no source item")]
    MissingItem,

    #[error("worker task failed: {0}")]
    Task(String),

    /// Stopped by an interrupt before completing.
    #[error("interrupted")]
    Interrupted,
}

/// What a completed action leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub mutation: Mutation,
    /// Set when the action completed but its finding is a failure
    /// (a file that does not pass its integrity test).
    pub problem: Option<String>,
}

impl Effect {
    fn clean(mutation: Mutation) -> Self {
        Self {
            mutation,
            problem: None,
        }
    }
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub tools: Arc<dyn AudioTools>,
    pub versions: ToolVersions,
    pub store: Arc<FingerprintStore>,
    pub source_root: PathBuf,
    pub mirror_root: PathBuf,
    pub mirror_method: MirrorMethod,
    pub fingerprint_kind: FingerprintKind,
    pub allow_modification: bool,
}

/// Removes a partially written file unless disarmed.
///
/// Dropping the future of a killed tool drops this guard too, so partial
/// output never survives an interruption.
struct PartialOutput {
    path: PathBuf,
    armed: bool,
}

impl PartialOutput {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.armed && fs::symlink_metadata(&self.path).is_ok() {
            debug!(path = %self.path.display(), "Removing partial output");
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Run `f` on the blocking thread pool.
async fn blocking<T, F>(f: F) -> Result<T, ActionError>
where
    F: FnOnce() -> Result<T, ActionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ActionError::Task(e.to_string()))?
}

fn tag(version: &Option<String>, tool: &'static str) -> Result<String, ActionError> {
    version.clone().ok_or(ActionError::ToolUnavailable(tool))
}

fn stamp(key: &str, update: StampUpdate) -> Mutation {
    Mutation::Stamp {
        key: key.to_string(),
        update,
    }
}

/// Perform `planned.action`.
pub async fn execute(ctx: &WorkerContext, planned: &PlannedAction) -> Result<Effect, ActionError> {
    debug!(key = %planned.key, action = planned.action.as_str(), "Executing");
    if planned.action == Action::DeleteStaleRecord {
        return delete_stale(ctx, planned).await;
    }
    let item = planned.item.as_ref().ok_or(ActionError::MissingItem)?;
    match planned.action {
        Action::Test => test(ctx, item).await,
        Action::Reencode => reencode(ctx, item).await,
        Action::Transcode => transcode(ctx, item).await,
        Action::MirrorCopy => mirror_copy(ctx, item).await,
        Action::MirrorLink => mirror_link(ctx, item).await,
        Action::Skip | Action::DeleteStaleRecord => Err(ActionError::MissingItem),
    }
}

async fn test(ctx: &WorkerContext, item: &Item) -> Result<Effect, ActionError> {
    let tool = tag(&ctx.versions.flac, "flac")?;
    let outcome = ctx.tools.test(&item.path).await?;
    let (passed, problem) = match outcome {
        TestOutcome::Passed => (true, None),
        TestOutcome::Failed(details) => {
            let details = if details.is_empty() {
                "integrity test failed".to_string()
            } else {
                format!("integrity test failed: {}", details)
            };
            (false, Some(details))
        }
    };
    Ok(Effect {
        mutation: stamp(
            &item.key,
            StampUpdate::Tested {
                fingerprint: item.fingerprint.value.clone(),
                tool,
                passed,
            },
        ),
        problem,
    })
}

/// `<src>.tmp`, next to the source file.
fn reencode_temp_path(src: &Path) -> PathBuf {
    let mut tmp = src.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn reencode(ctx: &WorkerContext, item: &Item) -> Result<Effect, ActionError> {
    if !ctx.allow_modification {
        return Err(ActionError::ModificationNotAllowed);
    }
    let tool = tag(&ctx.versions.flac, "flac")?;
    let tmp = reencode_temp_path(&item.path);
    let guard = PartialOutput::new(tmp.clone());

    ctx.tools.reencode(&item.path, &tmp).await?;

    let src = item.path.clone();
    let kind = ctx.fingerprint_kind;
    let fingerprint = blocking(move || {
        fs::rename(&tmp, &src).map_err(|source| ActionError::Io {
            path: src.clone(),
            source,
        })?;
        Fingerprint::compute(&src, kind).map_err(|source| ActionError::Io { path: src, source })
    })
    .await?;
    guard.keep();

    Ok(Effect::clean(stamp(
        &item.key,
        StampUpdate::Reencoded {
            previous: item.fingerprint.value.clone(),
            fingerprint: fingerprint.value,
            tool,
        },
    )))
}

async fn transcode(ctx: &WorkerContext, item: &Item) -> Result<Effect, ActionError> {
    let tool = tag(&ctx.versions.transcoder, "transcoder")?;
    let dst = mirror_ops::transcode_path(&ctx.mirror_root, &item.key);
    let partial = mirror_ops::partial_path(&dst);
    {
        let dst = dst.clone();
        blocking(move || mirror_ops::ensure_parent(&dst).map_err(ActionError::from)).await?;
    }

    // The previous rendition stays at `dst` until the new one is complete
    let guard = PartialOutput::new(partial.clone());
    ctx.tools.transcode(&item.path, &partial).await?;
    blocking(move || mirror_ops::commit(&partial, &dst).map_err(ActionError::from)).await?;
    guard.keep();

    Ok(Effect::clean(stamp(
        &item.key,
        StampUpdate::Transcoded {
            fingerprint: item.fingerprint.value.clone(),
            tool,
        },
    )))
}

fn mirrored(ctx: &WorkerContext, item: &Item) -> Effect {
    Effect::clean(stamp(
        &item.key,
        StampUpdate::Mirrored {
            fingerprint: item.fingerprint.value.clone(),
            method: ctx.mirror_method.as_str().to_string(),
        },
    ))
}

async fn mirror_copy(ctx: &WorkerContext, item: &Item) -> Result<Effect, ActionError> {
    let src = item.path.clone();
    let dst = mirror_ops::mirror_path(&ctx.mirror_root, &item.key);

    if playlist::is_playlist(&src) {
        let records = ctx.store.snapshot();
        let source_root = ctx.source_root.clone();
        let mirror_root = ctx.mirror_root.clone();
        blocking(move || {
            let context = PlaylistContext {
                source_root: &source_root,
                mirror_root: &mirror_root,
                records: &records,
            };
            let converted = playlist::convert_file(&src, &context)?;
            mirror_ops::write(&dst, &converted)?;
            Ok(())
        })
        .await?;
    } else {
        blocking(move || mirror_ops::copy(&src, &dst).map_err(ActionError::from)).await?;
    }
    Ok(mirrored(ctx, item))
}

async fn mirror_link(ctx: &WorkerContext, item: &Item) -> Result<Effect, ActionError> {
    let src = item.path.clone();
    let dst = mirror_ops::mirror_path(&ctx.mirror_root, &item.key);
    let method = ctx.mirror_method;
    blocking(move || {
        match method {
            MirrorMethod::HardLink => mirror_ops::create_hard_link(&src, &dst)?,
            MirrorMethod::SoftLink | MirrorMethod::Copy => mirror_ops::create_symbolic_link(&src, &dst)?,
        }
        Ok(())
    })
    .await?;
    Ok(mirrored(ctx, item))
}

async fn delete_stale(ctx: &WorkerContext, planned: &PlannedAction) -> Result<Effect, ActionError> {
    let mut artifacts = Vec::new();
    if let Some(record) = &planned.record {
        if record.transcode.is_some() {
            artifacts.push(mirror_ops::transcode_path(&ctx.mirror_root, &planned.key));
        }
        if record.mirror.is_some() {
            artifacts.push(mirror_ops::mirror_path(&ctx.mirror_root, &planned.key));
        }
    }
    let mirror_root = ctx.mirror_root.clone();
    blocking(move || {
        for path in artifacts {
            if mirror_ops::remove_artifact(&mirror_root, &path)? {
                debug!(path = %path.display(), "Removed stale mirror file");
            }
        }
        Ok(())
    })
    .await?;

    Ok(Effect::clean(Mutation::Delete {
        key: planned.key.clone(),
    }))
}
