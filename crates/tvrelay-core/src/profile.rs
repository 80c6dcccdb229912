//! Transcode profiles and upstream resolution.
//!
//! A [`TranscodeProfile`] is the configured argument template for the
//! external transcoder. Exactly one of its tokens carries the [`URL_TOKEN`]
//! placeholder. The [`Resolver`] turns a [`RelayRequest`] into a concrete
//! argument vector: it picks the upstream URL, substitutes it into the
//! template and injects upstream request headers. Rendering is a pure
//! function of the profile, the configured sources and the request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

/// Placeholder replaced by the resolved upstream URL.
pub const URL_TOKEN: &str = "{url}";

/// Placeholder in `sources.stream_url` replaced by the requested channel.
pub const CHANNEL_TOKEN: &str = "{channel}";

/// URL schemes the transcoder is allowed to open.
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "rtmp", "rtmps", "rtsp", "rtp", "udp", "srt"];

/// HTTP headers forwarded to the upstream by the transcoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamHeaders {
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
}

impl UpstreamHeaders {
    /// Field-wise merge where `overrides` wins over `self`.
    #[must_use]
    pub fn merged(&self, overrides: &Self) -> Self {
        let pick = |over: &Option<String>, base: &Option<String>| {
            over.as_ref()
                .filter(|v| !v.trim().is_empty())
                .or(base.as_ref())
                .cloned()
        };
        Self {
            user_agent: pick(&overrides.user_agent, &self.user_agent),
            referer: pick(&overrides.referer, &self.referer),
            origin: pick(&overrides.origin, &self.origin),
        }
    }

    /// Reject values with control characters. A CR or LF would let a client
    /// smuggle extra header lines into the transcoder's upstream request.
    pub fn check(&self) -> std::result::Result<(), ResolutionError> {
        let fields = [
            ("user_agent", &self.user_agent),
            ("referer", &self.referer),
            ("origin", &self.origin),
        ];
        for (name, value) in fields {
            if value
                .as_deref()
                .is_some_and(|v| v.chars().any(char::is_control))
            {
                return Err(ResolutionError::InvalidHeader { name });
            }
        }
        Ok(())
    }

    /// Transcoder flags that make it send these headers to the upstream.
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ua) = &self.user_agent {
            args.push("-user_agent".to_string());
            args.push(ua.clone());
        }
        if let Some(referer) = &self.referer {
            args.push("-referer".to_string());
            args.push(referer.clone());
        }
        if let Some(origin) = &self.origin {
            args.push("-headers".to_string());
            args.push(format!("Origin: {origin}\r\n"));
        }
        args
    }
}

/// Argument template for the external transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeProfile {
    program: String,
    args: Vec<String>,
    /// Index into `args` of the token holding [`URL_TOKEN`].
    url_index: usize,
}

impl TranscodeProfile {
    /// Build a profile, checking that exactly one argument carries the URL
    /// placeholder and the program name is not empty.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Result<Self> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(Error::Profile("transcoder program is empty".to_string()));
        }

        let mut positions = args
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.contains(URL_TOKEN))
            .map(|(i, _)| i);
        let Some(url_index) = positions.next() else {
            return Err(Error::Profile(format!(
                "no argument contains the {URL_TOKEN} placeholder"
            )));
        };
        if positions.next().is_some() {
            return Err(Error::Profile(format!(
                "more than one argument contains the {URL_TOKEN} placeholder"
            )));
        }

        Ok(Self {
            program,
            args,
            url_index,
        })
    }

    /// Render the full argv (program first) for one upstream URL.
    ///
    /// Header flags go right before the `-i` that introduces the URL so they
    /// apply to the input; without a preceding `-i` they go right before the
    /// URL token itself.
    pub fn render(&self, url: &str, headers: &UpstreamHeaders) -> Vec<String> {
        let insert_at = if self.url_index > 0 && self.args[self.url_index - 1] == "-i" {
            self.url_index - 1
        } else {
            self.url_index
        };
        let header_args = headers.to_args();

        let mut argv = Vec::with_capacity(1 + self.args.len() + header_args.len());
        argv.push(self.program.clone());
        for (i, arg) in self.args.iter().enumerate() {
            if i == insert_at {
                argv.extend(header_args.iter().cloned());
            }
            if i == self.url_index {
                argv.push(arg.replace(URL_TOKEN, url));
            } else {
                argv.push(arg.clone());
            }
        }
        argv
    }
}

/// What a client asked to stream. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayRequest {
    channel: Option<String>,
    url: Option<String>,
    headers: UpstreamHeaders,
}

impl RelayRequest {
    /// Stream the configured default source.
    pub fn default_source() -> Self {
        Self::default()
    }

    /// Stream a named channel.
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            channel: Some(name.into()),
            ..Self::default()
        }
    }

    /// Stream a caller-supplied upstream URL.
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Attach per-request header overrides.
    #[must_use]
    pub fn with_headers(mut self, headers: UpstreamHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn upstream_url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub const fn headers(&self) -> &UpstreamHeaders {
        &self.headers
    }

    /// Short description for logs and session listings.
    ///
    /// Raw URLs are reduced to scheme and host; provider paths and query
    /// strings often carry account credentials.
    pub fn label(&self) -> String {
        match (&self.channel, &self.url) {
            (Some(channel), _) => format!("channel:{channel}"),
            (None, Some(url)) => format!("url:{}", redact_url(url)),
            (None, None) => "default".to_string(),
        }
    }
}

/// Configured upstream locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamSource {
    /// Fixed source, or a template containing [`CHANNEL_TOKEN`].
    pub stream_url: Option<String>,
    /// Explicit channel name → URL mapping, checked before the template.
    pub channels: BTreeMap<String, String>,
}

/// Errors turning a request into an upstream URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("No upstream URL in request and no default source configured")]
    NoUpstream,

    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: String },

    #[error("Invalid upstream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported upstream URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("Invalid {name} header value: control characters are not allowed")]
    InvalidHeader { name: &'static str },
}

/// Renders relay requests into transcoder argument vectors.
#[derive(Debug, Clone)]
pub struct Resolver {
    profile: TranscodeProfile,
    source: UpstreamSource,
    headers: UpstreamHeaders,
}

impl Resolver {
    pub const fn new(
        profile: TranscodeProfile,
        source: UpstreamSource,
        headers: UpstreamHeaders,
    ) -> Self {
        Self {
            profile,
            source,
            headers,
        }
    }

    /// Build a resolver from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let profile = config.transcode.profile()?;
        let source = UpstreamSource {
            stream_url: config.sources.stream_url.clone(),
            channels: config.channels.clone(),
        };
        Ok(Self::new(profile, source, config.headers.clone()))
    }

    /// Pick the upstream URL for a request.
    pub fn resolve_url(&self, request: &RelayRequest) -> std::result::Result<String, ResolutionError> {
        if let Some(url) = request.upstream_url().map(str::trim).filter(|u| !u.is_empty()) {
            return validate_url(url);
        }

        let template = self
            .source
            .stream_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());

        match request.channel_name().map(str::trim).filter(|c| !c.is_empty()) {
            Some(channel) => {
                if let Some(url) = self.source.channels.get(channel) {
                    return validate_url(url);
                }
                match template {
                    Some(t) if t.contains(CHANNEL_TOKEN) => {
                        validate_url(&t.replace(CHANNEL_TOKEN, channel))
                    }
                    _ => Err(ResolutionError::UnknownChannel {
                        channel: channel.to_string(),
                    }),
                }
            }
            None => match template {
                Some(t) if !t.contains(CHANNEL_TOKEN) => validate_url(t),
                _ => Err(ResolutionError::NoUpstream),
            },
        }
    }

    /// Render the concrete argv for a request.
    pub fn render(&self, request: &RelayRequest) -> std::result::Result<Vec<String>, ResolutionError> {
        let url = self.resolve_url(request)?;
        let headers = self.headers.merged(request.headers());
        headers.check()?;
        Ok(self.profile.render(&url, &headers))
    }
}

fn redact_url(raw: &str) -> String {
    let Ok(parsed) = url::Url::parse(raw) else {
        return "<invalid>".to_string();
    };
    match (parsed.host_str(), parsed.port()) {
        (Some(host), Some(port)) => format!("{}://{host}:{port}", parsed.scheme()),
        (Some(host), None) => format!("{}://{host}", parsed.scheme()),
        (None, _) => format!("{}:", parsed.scheme()),
    }
}

fn validate_url(raw: &str) -> std::result::Result<String, ResolutionError> {
    let parsed = url::Url::parse(raw).map_err(|e| ResolutionError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(ResolutionError::UnsupportedScheme {
            scheme: parsed.scheme().to_string(),
        });
    }
    Ok(parsed.into())
}
