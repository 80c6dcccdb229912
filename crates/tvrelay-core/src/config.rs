//! Configuration resolution for tvrelay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (`--config`, or `~/.config/tvrelay/config.toml`)
//! 3. Environment variables (`TVRELAY_*`)
//! 4. CLI arguments (applied by the daemon, highest priority)

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::profile::{TranscodeProfile, UpstreamHeaders};

/// Complete tvrelay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub sources: SourcesConfig,
    /// Channel name → upstream URL.
    pub channels: BTreeMap<String, String>,
    pub playlist: PlaylistConfig,
    pub transcode: TranscodeConfig,
    pub headers: UpstreamHeaders,
    pub cache: CacheConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub log_level: String,
    /// Externally reachable base URL, used when rewriting playlist entries.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            log_level: "info".to_string(),
            public_base_url: None,
        }
    }
}

/// Upstream locations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SourcesConfig {
    pub m3u_url: Option<String>,
    pub epg_url: Option<String>,
    /// Default stream source. May contain `{channel}`.
    pub stream_url: Option<String>,
}

/// Playlist filtering and rewriting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PlaylistConfig {
    /// Keep only these groups (all groups when empty).
    pub include_groups: Vec<String>,
    pub exclude_groups: Vec<String>,
    /// Case-insensitive channel name substring filter.
    pub name_contains: Option<String>,
    /// Point entry URLs at this relay instead of the upstream.
    pub rewrite_urls: bool,
}

/// Transcoder invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranscodeConfig {
    pub program: String,
    /// Arguments after the program name; exactly one must contain `{url}`.
    pub args: Vec<String>,
    pub chunk_size: usize,
    pub terminate_timeout_secs: u64,
    pub max_sessions: usize,
    pub content_type: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: [
                "-hide_banner",
                "-loglevel",
                "error",
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
                "-i",
                "{url}",
                "-c:v",
                "copy",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-ac",
                "2",
                "-f",
                "mpegts",
                "-",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            chunk_size: 64 * 1024,
            terminate_timeout_secs: 5,
            max_sessions: 16,
            content_type: "video/mp2t".to_string(),
        }
    }
}

impl TranscodeConfig {
    pub fn profile(&self) -> Result<TranscodeProfile> {
        TranscodeProfile::new(self.program.clone(), self.args.clone())
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Upstream fetch caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub playlist_ttl_secs: u64,
    pub epg_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            playlist_ttl_secs: 300,
            epg_ttl_secs: 3600,
            fetch_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<()> {
        self.transcode.profile()?;
        if self.transcode.chunk_size == 0 {
            return Err(Error::Config("transcode.chunk_size must be positive".into()));
        }
        if self.transcode.max_sessions == 0 {
            return Err(Error::Config("transcode.max_sessions must be positive".into()));
        }
        self.headers
            .check()
            .map_err(|e| Error::Config(format!("headers: {e}")))?;
        Ok(())
    }
}

/// Default config file location: `$XDG_CONFIG_HOME/tvrelay/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tvrelay").join("config.toml"))
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the default path is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match default_config_path() {
            Some(default) if default.exists() => load_config_file(&default)?,
            _ => {
                debug!("No config file found, using defaults");
                Config::default()
            }
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Apply `TVRELAY_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("TVRELAY_M3U_URL") {
        config.sources.m3u_url = Some(val);
    }
    if let Some(val) = lookup("TVRELAY_EPG_URL") {
        config.sources.epg_url = Some(val);
    }
    if let Some(val) = lookup("TVRELAY_STREAM_URL") {
        config.sources.stream_url = Some(val);
    }
    if let Some(val) = lookup("TVRELAY_TRANSCODER") {
        config.transcode.program = val;
    }
    if let Some(val) = lookup("TVRELAY_LOG_LEVEL") {
        config.server.log_level = val;
    }
    if let Some(n) = lookup("TVRELAY_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
        config.transcode.max_sessions = n;
    }
    if let Some(val) = lookup("TVRELAY_PUBLIC_BASE_URL") {
        config.server.public_base_url = Some(val);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.transcode.program, "ffmpeg");
        assert_eq!(config.transcode.content_type, "video/mp2t");
        assert_eq!(config.server.listen.port(), 5000);
    }

    #[test]
    fn parses_full_document() {
        let config = Config::from_toml_str(
            r#"
            [server]
            listen = "127.0.0.1:8080"
            public_base_url = "http://tv.lan:8080"

            [sources]
            m3u_url = "http://provider/list.m3u"
            epg_url = "http://provider/epg.xml"
            stream_url = "http://provider/live/{channel}.ts"

            [channels]
            news = "http://news/live.ts"

            [playlist]
            include_groups = ["UK", "US"]
            rewrite_urls = true

            [transcode]
            program = "/usr/bin/ffmpeg"
            args = ["-i", "{url}", "-f", "mpegts", "-"]
            chunk_size = 1024

            [headers]
            user_agent = "VLC/3.0.18"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.channels.get("news").unwrap(), "http://news/live.ts");
        assert_eq!(config.playlist.include_groups, ["UK", "US"]);
        assert!(config.playlist.rewrite_urls);
        assert_eq!(config.transcode.chunk_size, 1024);
        assert_eq!(config.transcode.max_sessions, 16);
        assert_eq!(config.headers.user_agent.as_deref(), Some("VLC/3.0.18"));
        assert_eq!(config.cache.playlist_ttl_secs, 300);
    }

    #[test]
    fn rejects_profile_without_placeholder() {
        let err = Config::from_toml_str(
            r#"
            [transcode]
            args = ["-i", "http://fixed", "-"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Profile(_)));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let err = Config::from_toml_str("[transcode]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_header_with_line_break() {
        let err = Config::from_toml_str("[headers]\nreferer = \"http://a/\\r\\nX: y\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::from_toml_str("[server]\nlisten_port = 1\n").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("TVRELAY_M3U_URL", "http://env/list.m3u"),
            ("TVRELAY_MAX_SESSIONS", "3"),
            ("TVRELAY_TRANSCODER", "avconv"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.sources.m3u_url.as_deref(), Some("http://env/list.m3u"));
        assert_eq!(config.transcode.max_sessions, 3);
        assert_eq!(config.transcode.program, "avconv");
        assert!(config.sources.epg_url.is_none());
    }

    #[test]
    fn explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sources]\nm3u_url = \"http://file/list.m3u\"").unwrap();
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.sources.m3u_url.as_deref(), Some("http://file/list.m3u"));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
