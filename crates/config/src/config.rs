//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// One or more semantic problems found by `Config::validate`
    Invalid(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(problems) => {
                write!(f, "Invalid configuration: {}", problems.join("; "))
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// How an item's content state is summarized
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FingerprintKind {
    /// Last modification timestamp
    #[default]
    Mtime,
    /// SHA-224 digest of the file contents
    ContentHash,
}

impl FingerprintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FingerprintKind::Mtime => "mtime",
            FingerprintKind::ContentHash => "content-hash",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "mtime" => Some(FingerprintKind::Mtime),
            "content-hash" | "content_hash" | "hash" => Some(FingerprintKind::ContentHash),
            _ => None,
        }
    }
}

impl std::fmt::Display for FingerprintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How non-audio files are reproduced in the mirror
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorMethod {
    #[default]
    Copy,
    SoftLink,
    HardLink,
}

impl MirrorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorMethod::Copy => "copy",
            MirrorMethod::SoftLink => "soft-link",
            MirrorMethod::HardLink => "hard-link",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().replace('_', "-").as_str() {
            "copy" => Some(MirrorMethod::Copy),
            "soft-link" | "symlink" => Some(MirrorMethod::SoftLink),
            "hard-link" => Some(MirrorMethod::HardLink),
            _ => None,
        }
    }
}

impl std::fmt::Display for MirrorMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoder used to produce the portable audio files
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TranscoderKind {
    #[default]
    Opusenc,
    Ffmpeg,
}

impl TranscoderKind {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "opusenc" => Some(TranscoderKind::Opusenc),
            "ffmpeg" => Some(TranscoderKind::Ffmpeg),
            _ => None,
        }
    }
}

/// Source and mirror locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Root of the FLAC library
    #[serde(default)]
    pub source: PathBuf,
    /// Root of the portable mirror
    #[serde(default)]
    pub mirror: PathBuf,
    /// Location of the fingerprint store
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Playlists referencing source paths
    #[serde(default)]
    pub playlists: Option<PathBuf>,
    /// Output directory for converted playlists
    #[serde(default)]
    pub portable_playlists: Option<PathBuf>,
    /// Skip dot-named files and prune dot-named directories
    #[serde(default = "default_true")]
    pub ignore_hidden: bool,
    /// Permit rewriting files in the source library (reencode)
    #[serde(default)]
    pub allow_modification: bool,
}

fn default_status_file() -> PathBuf {
    PathBuf::from("tunemirror-status.toml")
}

fn default_true() -> bool {
    true
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            mirror: PathBuf::new(),
            status_file: default_status_file(),
            playlists: None,
            portable_playlists: None,
            ignore_hidden: true,
            allow_modification: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FingerprintConfig {
    #[serde(default)]
    pub kind: FingerprintKind,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Concurrent workers (0 = one per available CPU)
    #[serde(default)]
    pub threads: u32,
    /// Upper bound on a single external tool invocation
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// Store flush period while actions run (0 = only at the end)
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_flush_interval_secs() -> u64 {
    30
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            tool_timeout_secs: default_tool_timeout_secs(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MirrorConfig {
    #[serde(default)]
    pub method: MirrorMethod,
}

/// Codec settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecConfig {
    #[serde(default)]
    pub transcoder: TranscoderKind,
    /// Target Opus bitrate in kbit/s
    #[serde(default = "default_opus_bitrate")]
    pub opus_bitrate: u32,
    /// Padding block size written on reencode, in bytes
    #[serde(default = "default_flac_padding")]
    pub flac_padding: u32,
}

fn default_opus_bitrate() -> u32 {
    128
}

fn default_flac_padding() -> u32 {
    8192
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            transcoder: TranscoderKind::default(),
            opus_bitrate: default_opus_bitrate(),
            flac_padding: default_flac_padding(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub codec: CodecConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            library: LibraryConfig::default(),
            fingerprint: FingerprintConfig::default(),
            workers: WorkersConfig::default(),
            mirror: MirrorConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    ///
    /// Leading `~` in any configured path is expanded to `$HOME`.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_paths();
        Ok(config)
    }

    fn expand_paths(&mut self) {
        let lib = &mut self.library;
        lib.source = expand_home(&lib.source);
        lib.mirror = expand_home(&lib.mirror);
        lib.status_file = expand_home(&lib.status_file);
        lib.playlists = lib.playlists.as_deref().map(expand_home);
        lib.portable_playlists = lib.portable_playlists.as_deref().map(expand_home);
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - TUNEMIRROR_LOG_LEVEL -> log_level
    /// - TUNEMIRROR_SOURCE -> library.source
    /// - TUNEMIRROR_MIRROR -> library.mirror
    /// - TUNEMIRROR_STATUS_FILE -> library.status_file
    /// - TUNEMIRROR_IGNORE_HIDDEN -> library.ignore_hidden
    /// - TUNEMIRROR_ALLOW_MODIFICATION -> library.allow_modification
    /// - TUNEMIRROR_FINGERPRINT_KIND -> fingerprint.kind
    /// - TUNEMIRROR_THREADS -> workers.threads
    /// - TUNEMIRROR_MIRROR_METHOD -> mirror.method
    /// - TUNEMIRROR_TRANSCODER -> codec.transcoder
    /// - TUNEMIRROR_OPUS_BITRATE -> codec.opus_bitrate
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("TUNEMIRROR_LOG_LEVEL") {
            let level = val.to_lowercase();
            if LOG_LEVELS.contains(&level.as_str()) {
                self.log_level = level;
            }
        }

        if let Ok(val) = env::var("TUNEMIRROR_SOURCE") {
            self.library.source = expand_home(Path::new(&val));
        }
        if let Ok(val) = env::var("TUNEMIRROR_MIRROR") {
            self.library.mirror = expand_home(Path::new(&val));
        }
        if let Ok(val) = env::var("TUNEMIRROR_STATUS_FILE") {
            self.library.status_file = expand_home(Path::new(&val));
        }

        if let Ok(val) = env::var("TUNEMIRROR_IGNORE_HIDDEN") {
            if let Some(flag) = parse_bool(&val) {
                self.library.ignore_hidden = flag;
            }
        }
        if let Ok(val) = env::var("TUNEMIRROR_ALLOW_MODIFICATION") {
            if let Some(flag) = parse_bool(&val) {
                self.library.allow_modification = flag;
            }
        }

        if let Ok(val) = env::var("TUNEMIRROR_FINGERPRINT_KIND") {
            if let Some(kind) = FingerprintKind::parse(&val) {
                self.fingerprint.kind = kind;
            }
        }

        if let Ok(val) = env::var("TUNEMIRROR_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.workers.threads = threads;
            }
        }

        if let Ok(val) = env::var("TUNEMIRROR_MIRROR_METHOD") {
            if let Some(method) = MirrorMethod::parse(&val) {
                self.mirror.method = method;
            }
        }

        if let Ok(val) = env::var("TUNEMIRROR_TRANSCODER") {
            if let Some(transcoder) = TranscoderKind::parse(&val) {
                self.codec.transcoder = transcoder;
            }
        }

        if let Ok(val) = env::var("TUNEMIRROR_OPUS_BITRATE") {
            if let Ok(bitrate) = val.parse::<u32>() {
                self.codec.opus_bitrate = bitrate;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Check the configuration for semantic problems
    ///
    /// Every problem is collected, so a single error lists everything that
    /// needs fixing. Filesystem existence is not checked here.
    pub fn validate(&self, cpu_count: u32) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            problems.push(format!("invalid log level '{}'", self.log_level));
        }

        let source = &self.library.source;
        let mirror = &self.library.mirror;
        if source.as_os_str().is_empty() || mirror.as_os_str().is_empty() {
            problems.push("library.source and library.mirror must both be set".to_string());
        } else {
            check_disjoint(source, "library source", mirror, "mirror", &mut problems);
        }

        if let (Some(playlists), Some(portable)) = (
            self.library.playlists.as_ref(),
            self.library.portable_playlists.as_ref(),
        ) {
            check_disjoint(
                playlists,
                "playlist directory",
                portable,
                "portable playlist directory",
                &mut problems,
            );
            if !mirror.as_os_str().is_empty() {
                if portable == mirror {
                    problems.push(format!(
                        "portable playlist directory {} matches mirror {}",
                        portable.display(),
                        mirror.display()
                    ));
                } else if portable.starts_with(mirror) {
                    problems.push(format!(
                        "portable playlist directory {} is inside mirror {}",
                        portable.display(),
                        mirror.display()
                    ));
                }
            }
        }

        if self.codec.opus_bitrate == 0 {
            problems.push("codec.opus_bitrate must be a positive integer".to_string());
        }

        if self.workers.threads > cpu_count {
            problems.push(format!(
                "workers.threads ({}) cannot exceed available cores ({})",
                self.workers.threads, cpu_count
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Record a problem if two directories are equal or nested inside each other
fn check_disjoint(a: &Path, a_name: &str, b: &Path, b_name: &str, problems: &mut Vec<String>) {
    if a == b {
        problems.push(format!(
            "{} {} matches {} {}",
            b_name,
            b.display(),
            a_name,
            a.display()
        ));
    } else if b.starts_with(a) {
        problems.push(format!(
            "{} {} is inside {} {}",
            b_name,
            b.display(),
            a_name,
            a.display()
        ));
    } else if a.starts_with(b) {
        problems.push(format!(
            "{} {} is inside {} {}",
            a_name,
            a.display(),
            b_name,
            b.display()
        ));
    }
}

/// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
