//! Playlist conversion from library paths to mirror paths.
//!
//! Library playlists reference `.flac` files. Their portable counterparts
//! reference the `.opus` renditions in the mirror. Text is decoded as UTF-8,
//! falling back to Latin-1, and written back in the encoding it came in.

use crate::scan::{has_extension, relative_key, ItemKind};
use crate::store::Records;
use crate::tools::transcoder::OUTPUT_EXTENSION;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const PLAYLIST_EXTENSIONS: &[&str] = &[".m3u", ".m3u8"];

const FLAC_SUFFIX: &str = ".flac";

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk {}: {source}", .root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

pub fn is_playlist(path: &Path) -> bool {
    has_extension(path, PLAYLIST_EXTENSIONS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// Decode playlist bytes, falling back to Latin-1 for invalid UTF-8.
pub fn decode(bytes: &[u8]) -> (String, TextEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), TextEncoding::Utf8),
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), TextEncoding::Latin1),
    }
}

/// Encode `text` back into `encoding`. Characters Latin-1 cannot hold become `?`.
pub fn encode(text: &str, encoding: TextEncoding) -> Vec<u8> {
    match encoding {
        TextEncoding::Utf8 => text.as_bytes().to_vec(),
        TextEncoding::Latin1 => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect(),
    }
}

/// What the converter needs to know about the library.
#[derive(Debug, Clone, Copy)]
pub struct PlaylistContext<'a> {
    pub source_root: &'a Path,
    pub mirror_root: &'a Path,
    pub records: &'a Records,
}

impl PlaylistContext<'_> {
    /// A referenced file keeps its `.flac` name only when the store knows it
    /// as something other than audio. Audio records get a rendition from the
    /// mirror lane, possibly later in the same run as this playlist.
    fn has_rendition(&self, referenced: &Path) -> bool {
        relative_key(self.source_root, referenced)
            .and_then(|key| self.records.get(&key))
            .map_or(true, |record| record.kind == ItemKind::Audio)
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn ends_with_flac(line: &str) -> bool {
    line.len() >= FLAC_SUFFIX.len()
        && line.is_char_boundary(line.len() - FLAC_SUFFIX.len())
        && line[line.len() - FLAC_SUFFIX.len()..].eq_ignore_ascii_case(FLAC_SUFFIX)
}

/// Rewrite one entry line (without its line terminator).
fn convert_line(line: &str, playlist_dir: &Path, ctx: &PlaylistContext<'_>) -> String {
    if line.trim_start().starts_with('#') || !ends_with_flac(line) {
        return line.to_string();
    }
    let reference = Path::new(line);
    let resolved = if reference.is_absolute() {
        normalize(reference)
    } else {
        normalize(&playlist_dir.join(reference))
    };
    if !ctx.has_rendition(&resolved) {
        return line.to_string();
    }

    if reference.is_absolute() {
        if let Some(key) = relative_key(ctx.source_root, &resolved) {
            let target = ctx.mirror_root.join(key).with_extension(OUTPUT_EXTENSION);
            return target.to_string_lossy().into_owned();
        }
    }
    format!("{}.{}", &line[..line.len() - FLAC_SUFFIX.len()], OUTPUT_EXTENSION)
}

/// Rewrite playlist text, keeping comments and line terminators intact.
pub fn convert_text(text: &str, playlist_dir: &Path, ctx: &PlaylistContext<'_>) -> String {
    let mut out = String::with_capacity(text.len());
    for chunk in text.split_inclusive('\n') {
        let (body, terminator) = match chunk.strip_suffix("\r\n") {
            Some(body) => (body, "\r\n"),
            None => match chunk.strip_suffix('\n') {
                Some(body) => (body, "\n"),
                None => (chunk, ""),
            },
        };
        out.push_str(&convert_line(body, playlist_dir, ctx));
        out.push_str(terminator);
    }
    out
}

/// Convert raw playlist bytes, preserving their encoding.
pub fn convert_bytes(bytes: &[u8], playlist_dir: &Path, ctx: &PlaylistContext<'_>) -> Vec<u8> {
    let (text, encoding) = decode(bytes);
    if encoding == TextEncoding::Latin1 {
        debug!(dir = %playlist_dir.display(), "Playlist is not UTF-8, using Latin-1");
    }
    encode(&convert_text(&text, playlist_dir, ctx), encoding)
}

/// Read the playlist at `src` and return its converted contents.
pub fn convert_file(src: &Path, ctx: &PlaylistContext<'_>) -> Result<Vec<u8>, PlaylistError> {
    let bytes = fs::read(src).map_err(|source| PlaylistError::Io {
        path: src.to_path_buf(),
        source,
    })?;
    let dir = src.parent().unwrap_or_else(|| Path::new(""));
    Ok(convert_bytes(&bytes, dir, ctx))
}

/// Outcome of a playlist directory conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaylistReport {
    pub converted: usize,
    pub failed: Vec<String>,
    pub skipped: usize,
}

/// Recreate `portable_dir` from every playlist under `library_dir`.
///
/// The portable directory is wiped first, so playlists deleted from the
/// library disappear too. A dry run only reports what would be converted.
pub fn convert_tree(
    library_dir: &Path,
    portable_dir: &Path,
    ctx: &PlaylistContext<'_>,
    dry_run: bool,
) -> Result<PlaylistReport, PlaylistError> {
    info!(from = %library_dir.display(), to = %portable_dir.display(), "Converting playlists");
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PlaylistError::Io { path, source }
    };

    if !dry_run {
        if portable_dir.is_dir() {
            fs::remove_dir_all(portable_dir).map_err(io_err(portable_dir))?;
        }
        fs::create_dir_all(portable_dir).map_err(io_err(portable_dir))?;
    }

    let mut report = PlaylistReport::default();
    for entry in WalkDir::new(library_dir).sort_by_file_name() {
        let entry = entry.map_err(|source| PlaylistError::Walk {
            root: library_dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(library_dir) else {
            continue;
        };
        if !is_playlist(path) {
            debug!(path = %path.display(), "Skipping non-playlist file");
            report.skipped += 1;
            continue;
        }

        let output = portable_dir.join(relative);
        if dry_run {
            debug!(from = %path.display(), to = %output.display(), "Would convert playlist");
            report.converted += 1;
            continue;
        }
        let result = convert_file(path, ctx).and_then(|bytes| {
            if let Some(parent) = output.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::write(&output, bytes).map_err(io_err(&output))
        });
        match result {
            Ok(()) => {
                debug!(from = %path.display(), to = %output.display(), "Converted playlist");
                report.converted += 1;
            }
            Err(e) => {
                warn!(error = %e, "Playlist conversion failed");
                report.failed.push(relative.to_string_lossy().into_owned());
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{Fingerprint, FingerprintKind};
    use crate::store::Record;
    use tempfile::TempDir;

    fn records(entries: &[(&str, ItemKind)]) -> Records {
        entries
            .iter()
            .map(|(key, kind)| {
                let record = Record::new(*kind, Fingerprint::new(FingerprintKind::Mtime, "t"));
                (key.to_string(), record)
            })
            .collect()
    }

    #[test]
    fn test_is_playlist() {
        assert!(is_playlist(Path::new("a.m3u")));
        assert!(is_playlist(Path::new("a.M3U8")));
        assert!(!is_playlist(Path::new("a.pls")));
    }

    #[test]
    fn test_relative_entries_rewritten() {
        let recs = records(&[("Artist/01.flac", ItemKind::Audio)]);
        let ctx = PlaylistContext {
            source_root: Path::new("/lib"),
            mirror_root: Path::new("/mirror"),
            records: &recs,
        };
        let text = "#EXTM3U\n#EXTINF:123,Song.flac\nArtist/01.flac\r\nArtist/cover.jpg\n../elsewhere/x.flac";

        let out = convert_text(text, Path::new("/lib"), &ctx);
        assert_eq!(
            out,
            "#EXTM3U\n#EXTINF:123,Song.flac\nArtist/01.opus\r\nArtist/cover.jpg\n../elsewhere/x.opus"
        );
    }

    #[test]
    fn test_only_non_audio_records_keep_flac() {
        let recs = records(&[("A/pending.flac", ItemKind::Audio), ("A/odd.flac", ItemKind::Other)]);
        let ctx = PlaylistContext {
            source_root: Path::new("/lib"),
            mirror_root: Path::new("/mirror"),
            records: &recs,
        };
        let out = convert_text("pending.flac\nodd.flac\nunknown.FLAC\n", Path::new("/lib/A"), &ctx);
        assert_eq!(out, "pending.opus\nodd.flac\nunknown.opus\n");
    }

    #[test]
    fn test_absolute_entries_rerooted() {
        let recs = records(&[("A/01.flac", ItemKind::Audio)]);
        let ctx = PlaylistContext {
            source_root: Path::new("/lib"),
            mirror_root: Path::new("/mirror"),
            records: &recs,
        };
        let out = convert_text(
            "/lib/A/./01.flac\n/other/02.flac\n",
            Path::new("/playlists"),
            &ctx,
        );
        assert_eq!(out, "/mirror/A/01.opus\n/other/02.opus\n");
    }

    #[test]
    fn test_latin1_round_trip() {
        let recs = Records::new();
        let ctx = PlaylistContext {
            source_root: Path::new("/lib"),
            mirror_root: Path::new("/mirror"),
            records: &recs,
        };
        // "Café.flac" in Latin-1
        let input = b"Caf\xe9.flac\n".to_vec();
        let (_, encoding) = decode(&input);
        assert_eq!(encoding, TextEncoding::Latin1);

        let out = convert_bytes(&input, Path::new("/lib"), &ctx);
        assert_eq!(out, b"Caf\xe9.opus\n".to_vec());
    }

    #[test]
    fn test_utf8_kept_as_utf8() {
        let recs = Records::new();
        let ctx = PlaylistContext {
            source_root: Path::new("/lib"),
            mirror_root: Path::new("/mirror"),
            records: &recs,
        };
        let out = convert_bytes("Café.flac".as_bytes(), Path::new("/lib"), &ctx);
        assert_eq!(String::from_utf8(out).unwrap(), "Café.opus");
    }

    #[test]
    fn test_convert_tree_recreates_portable_dir() {
        let dir = TempDir::new().unwrap();
        let library = dir.path().join("playlists");
        let portable = dir.path().join("portable");
        fs::create_dir_all(library.join("mixes")).unwrap();
        fs::create_dir_all(&portable).unwrap();
        fs::write(portable.join("stale.m3u"), "old").unwrap();
        fs::write(library.join("mixes/road.m3u8"), "../A/01.flac\n").unwrap();
        fs::write(library.join("readme.txt"), "notes").unwrap();

        let recs = Records::new();
        let ctx = PlaylistContext {
            source_root: dir.path(),
            mirror_root: Path::new("/mirror"),
            records: &recs,
        };

        let dry = convert_tree(&library, &portable, &ctx, true).unwrap();
        assert_eq!(dry.converted, 1);
        assert!(portable.join("stale.m3u").exists());

        let report = convert_tree(&library, &portable, &ctx, false).unwrap();
        assert_eq!(report.converted, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());
        assert!(!portable.join("stale.m3u").exists());
        assert_eq!(
            fs::read_to_string(portable.join("mixes/road.m3u8")).unwrap(),
            "../A/01.opus\n"
        );
    }
}
