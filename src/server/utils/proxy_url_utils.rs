use serde::Deserialize;
use url::Url;

use crate::server::error::{AppResult, Error};

/// raw query of `/playlist` and `/segment`, everything optional so a missing url is a clean 400
/// instead of an extractor rejection
#[derive(Debug, Default, Deserialize)]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub cookie: Option<String>,
    pub ua: Option<String>,
    #[serde(rename = "ref")]
    pub referer: Option<String>,
}

/// headers the origin needs, carried verbatim inside every relay link
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// one relay call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub target_url: Url,
    pub credentials: Credentials,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TryFrom<ProxyQuery> for ProxyRequest {
    type Error = Error;

    fn try_from(query: ProxyQuery) -> AppResult<Self> {
        let raw = non_empty(query.url)
            .ok_or_else(|| Error::BadRequest("missing url parameter".to_string()))?;

        let target_url = Url::parse(raw.trim())
            .map_err(|e| Error::BadRequest(format!("invalid url parameter: {}", e)))?;

        if target_url.scheme() != "http" && target_url.scheme() != "https" {
            return Err(Error::BadRequest("Invalid URL format".to_string()));
        }

        Ok(Self {
            target_url,
            credentials: Credentials {
                cookie: non_empty(query.cookie),
                user_agent: non_empty(query.ua),
                referer: non_empty(query.referer),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyRoute {
    Playlist,
    Segment,
}

impl ProxyRoute {
    fn path(&self) -> &'static str {
        match self {
            Self::Playlist => "/playlist",
            Self::Segment => "/segment",
        }
    }
}

/// builds links back into the relay, `base` is whatever address the player (or a cast receiver)
/// can reach us on, e.g. `http://192.168.1.20:8089`
#[derive(Debug, Clone)]
pub struct ProxyLinkBuilder {
    base: String,
    nested_playlists: bool,
}

impl ProxyLinkBuilder {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            nested_playlists: false,
        }
    }

    /// send `.m3u8` references through /playlist instead of /segment so variant and rendition
    /// playlists get rewritten as well
    pub fn with_nested_playlists(mut self, enabled: bool) -> Self {
        self.nested_playlists = enabled;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// route for a reference found inside a manifest, /segment unless nested playlists are on and
    /// the target is itself a playlist
    pub fn route_for(&self, target: &Url) -> ProxyRoute {
        let path = target.path().to_ascii_lowercase();
        if self.nested_playlists && (path.ends_with(".m3u8") || path.ends_with(".m3u")) {
            ProxyRoute::Playlist
        } else {
            ProxyRoute::Segment
        }
    }

    pub fn link(&self, route: ProxyRoute, target: &str, credentials: &Credentials) -> String {
        let mut link = format!(
            "{}{}?url={}",
            self.base,
            route.path(),
            urlencoding::encode(target)
        );

        let params = [
            ("cookie", &credentials.cookie),
            ("ua", &credentials.user_agent),
            ("ref", &credentials.referer),
        ];
        for (key, value) in params {
            if let Some(value) = value {
                link.push('&');
                link.push_str(key);
                link.push('=');
                link.push_str(&urlencoding::encode(value));
            }
        }

        link
    }

    pub fn playlist(&self, target: &str, credentials: &Credentials) -> String {
        self.link(ProxyRoute::Playlist, target, credentials)
    }

    pub fn segment(&self, target: &str, credentials: &Credentials) -> String {
        self.link(ProxyRoute::Segment, target, credentials)
    }
}
