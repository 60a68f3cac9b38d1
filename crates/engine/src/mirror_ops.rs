//! File operations on the mirror tree.
//!
//! The mirror is written only through these helpers. A placement is built
//! under a hidden partial name next to its destination and renamed over it
//! once complete, so a failed placement leaves the previous file in place.
//! Removals prune directories that end up empty.

use crate::tools::transcoder::OUTPUT_EXTENSION;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// Hard links cannot cross filesystems.
    #[error("cannot hard-link {} into {}: different filesystems", .source_path.display(), .mirror_dir.display())]
    CrossVolume {
        source_path: PathBuf,
        mirror_dir: PathBuf,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MirrorError + '_ {
    move |source| MirrorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where a non-audio item lands in the mirror.
pub fn mirror_path(mirror_root: &Path, key: &str) -> PathBuf {
    mirror_root.join(key)
}

/// Where the transcoded rendition of an audio item lands.
pub fn transcode_path(mirror_root: &Path, key: &str) -> PathBuf {
    mirror_root.join(key).with_extension(OUTPUT_EXTENSION)
}

/// Hidden sibling of `dst` that a placement is built under.
///
/// The extension is kept so tools that pick a container from the output
/// name still see the right one: `01.opus` becomes `.01.part.opus`.
pub fn partial_path(dst: &Path) -> PathBuf {
    let stem = dst.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match dst.extension() {
        Some(ext) => format!(".{}.part.{}", stem, ext.to_string_lossy()),
        None => format!(".{}.part", stem),
    };
    dst.with_file_name(name)
}

/// Create the parent directories of `dst`.
pub fn ensure_parent(dst: &Path) -> Result<(), MirrorError> {
    match dst.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(io_err(parent)),
        None => Ok(()),
    }
}

/// Remove a file or link at `path`; a missing path is fine.
fn remove_existing(path: &Path) -> Result<(), MirrorError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(io_err(path)),
        Ok(_) => fs::remove_file(path).map_err(io_err(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Move a finished placement at `partial` over `dst`.
pub fn commit(partial: &Path, dst: &Path) -> Result<(), MirrorError> {
    // rename cannot replace a directory
    if fs::symlink_metadata(dst).is_ok_and(|meta| meta.is_dir()) {
        remove_existing(dst)?;
    }
    fs::rename(partial, dst).map_err(io_err(dst))
}

/// Build `dst` through `place`, which receives the partial path to create.
/// On failure the partial file is removed and `dst` is left as it was.
fn replace_with<F>(dst: &Path, place: F) -> Result<(), MirrorError>
where
    F: FnOnce(&Path) -> Result<(), MirrorError>,
{
    ensure_parent(dst)?;
    let partial = partial_path(dst);
    remove_existing(&partial)?;
    let result = place(&partial).and_then(|()| commit(&partial, dst));
    if result.is_err() {
        let _ = remove_existing(&partial);
    }
    result
}

/// Copy `src` to `dst`.
pub fn copy(src: &Path, dst: &Path) -> Result<(), MirrorError> {
    // The rename replaces a stale link at `dst` instead of writing through it
    replace_with(dst, |partial| {
        fs::copy(src, partial).map_err(io_err(partial))?;
        Ok(())
    })
}

/// Write `contents` as the mirror file `dst`.
pub fn write(dst: &Path, contents: &[u8]) -> Result<(), MirrorError> {
    replace_with(dst, |partial| fs::write(partial, contents).map_err(io_err(partial)))
}

/// Point a symbolic link at `dst` to `src`.
#[cfg(unix)]
pub fn create_symbolic_link(src: &Path, dst: &Path) -> Result<(), MirrorError> {
    replace_with(dst, |partial| {
        std::os::unix::fs::symlink(src, partial).map_err(io_err(partial))
    })
}

#[cfg(not(unix))]
pub fn create_symbolic_link(src: &Path, dst: &Path) -> Result<(), MirrorError> {
    replace_with(dst, |partial| {
        std::os::windows::fs::symlink_file(src, partial).map_err(io_err(partial))
    })
}

/// Hard-link `dst` to `src`. Both must live on the same filesystem.
pub fn create_hard_link(src: &Path, dst: &Path) -> Result<(), MirrorError> {
    hard_link_checked(src, dst, same_device)
}

fn hard_link_checked<F>(src: &Path, dst: &Path, same: F) -> Result<(), MirrorError>
where
    F: FnOnce(&Path, &Path) -> Result<bool, MirrorError>,
{
    ensure_parent(dst)?;
    if let Some(parent) = dst.parent() {
        if !same(src, parent)? {
            return Err(MirrorError::CrossVolume {
                source_path: src.to_path_buf(),
                mirror_dir: parent.to_path_buf(),
            });
        }
    }
    replace_with(dst, |partial| fs::hard_link(src, partial).map_err(io_err(partial)))
}

/// True when `a` and `b` are on the same filesystem.
#[cfg(unix)]
pub fn same_device(a: &Path, b: &Path) -> Result<bool, MirrorError> {
    use std::os::unix::fs::MetadataExt;
    let a_dev = fs::metadata(a).map_err(io_err(a))?.dev();
    let b_dev = fs::metadata(b).map_err(io_err(b))?.dev();
    Ok(a_dev == b_dev)
}

#[cfg(not(unix))]
pub fn same_device(_a: &Path, _b: &Path) -> Result<bool, MirrorError> {
    Ok(true)
}

/// Remove the mirror file at `path`, then prune empty directories between it
/// and `mirror_root`. Returns whether a file was removed.
pub fn remove_artifact(mirror_root: &Path, path: &Path) -> Result<bool, MirrorError> {
    let existed = fs::symlink_metadata(path).is_ok();
    remove_existing(path)?;
    if let Some(parent) = path.parent() {
        prune_empty_dirs(mirror_root, parent);
    }
    Ok(existed)
}

/// Remove `dir` and its ancestors while they are empty, stopping at `root`.
pub fn prune_empty_dirs(root: &Path, dir: &Path) {
    let mut current = Some(dir);
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // Fails on a non-empty directory, which ends the climb
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
