//! M3U playlist parsing and filtering.
//!
//! Parsing is lenient: lines that do not fit the `#EXTINF` / URL pairing are
//! carried along untouched where possible and dropped otherwise.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::PlaylistConfig;

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).expect("static regex is valid")
});

const HEADER: &str = "#EXTM3U";

/// One channel entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    /// The raw `#EXTINF` line.
    pub extinf: String,
    /// Directive lines between `#EXTINF` and the URL (`#EXTVLCOPT`, `#EXTGRP`, ...).
    pub directives: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    /// Display name (text after the last top-level comma of `#EXTINF`).
    pub name: String,
    pub url: String,
}

impl PlaylistEntry {
    /// `group-title` attribute, falling back to an `#EXTGRP:` directive.
    pub fn group(&self) -> Option<&str> {
        self.attributes
            .get("group-title")
            .map(String::as_str)
            .or_else(|| {
                self.directives
                    .iter()
                    .find_map(|d| d.strip_prefix("#EXTGRP:"))
                    .map(str::trim)
            })
            .filter(|g| !g.is_empty())
    }
}

/// A parsed playlist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Playlist {
    /// The `#EXTM3U` line with its attributes (e.g. `url-tvg`).
    pub header: String,
    pub entries: Vec<PlaylistEntry>,
}

impl Playlist {
    /// Parse M3U text.
    pub fn parse(raw: &str) -> Self {
        let mut header = HEADER.to_string();
        let mut entries = Vec::new();
        let mut pending: Option<(String, Vec<String>)> = None;

        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.starts_with(HEADER) {
                header = line.to_string();
            } else if line.starts_with("#EXTINF") {
                pending = Some((line.to_string(), Vec::new()));
            } else if line.starts_with('#') {
                if let Some((_, directives)) = pending.as_mut() {
                    directives.push(line.to_string());
                }
            } else if let Some((extinf, directives)) = pending.take() {
                entries.push(PlaylistEntry {
                    attributes: parse_attributes(&extinf),
                    name: display_name(&extinf),
                    extinf,
                    directives,
                    url: line.to_string(),
                });
            }
        }

        Self { header, entries }
    }

    /// Serialize back to M3U text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64 * (self.entries.len() + 1));
        out.push_str(&self.header);
        out.push('\n');
        for entry in &self.entries {
            let _ = writeln!(out, "{}", entry.extinf);
            for directive in &entry.directives {
                let _ = writeln!(out, "{directive}");
            }
            let _ = writeln!(out, "{}", entry.url);
        }
        out
    }

    /// Sorted, de-duplicated group titles.
    pub fn group_titles(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter_map(PlaylistEntry::group)
            .map(ToString::to_string)
            .collect()
    }

    /// Keep only the entries matching `rules`.
    pub fn retain(&mut self, rules: &FilterRules) {
        self.entries.retain(|entry| rules.matches(entry));
    }

    /// Point every entry at this relay's `/stream?url=` endpoint.
    pub fn rewrite_urls(&mut self, base_url: &str) {
        for entry in &mut self.entries {
            entry.url = relay_url(base_url, &entry.url);
        }
    }
}

/// Group and name rules for [`filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    pub include_groups: Vec<String>,
    pub exclude_groups: Vec<String>,
    pub name_contains: Option<String>,
}

impl FilterRules {
    pub fn matches(&self, entry: &PlaylistEntry) -> bool {
        let group = entry.group().unwrap_or_default();
        if !self.include_groups.is_empty() && !self.include_groups.iter().any(|g| g == group) {
            return false;
        }
        if self.exclude_groups.iter().any(|g| g == group) {
            return false;
        }
        match self.name_contains.as_deref().map(str::trim) {
            Some(needle) if !needle.is_empty() => entry
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            _ => true,
        }
    }
}

impl From<&PlaylistConfig> for FilterRules {
    fn from(config: &PlaylistConfig) -> Self {
        Self {
            include_groups: config.include_groups.clone(),
            exclude_groups: config.exclude_groups.clone(),
            name_contains: config.name_contains.clone(),
        }
    }
}

/// Filter raw playlist text by group/name rules.
pub fn filter(raw: &str, rules: &FilterRules) -> String {
    let mut playlist = Playlist::parse(raw);
    playlist.retain(rules);
    playlist.render()
}

/// Sorted unique `group-title` values of raw playlist text.
pub fn group_titles(raw: &str) -> BTreeSet<String> {
    Playlist::parse(raw).group_titles()
}

/// `{base}/stream?url=<upstream>` with the upstream query-encoded.
pub fn relay_url(base_url: &str, upstream: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(upstream.as_bytes()).collect();
    format!("{}/stream?url={encoded}", base_url.trim_end_matches('/'))
}

fn parse_attributes(extinf: &str) -> BTreeMap<String, String> {
    ATTR_RE
        .captures_iter(extinf)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// Text after the last comma outside quoted attribute values.
fn display_name(extinf: &str) -> String {
    let mut in_quotes = false;
    let mut split_at = None;
    for (i, ch) in extinf.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => split_at = Some(i),
            _ => {}
        }
    }
    split_at
        .map(|i| extinf[i + 1..].trim().to_string())
        .unwrap_or_default()
}
