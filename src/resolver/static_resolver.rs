use async_trait::async_trait;
use axum::http::header;
use tracing::{debug, warn};

use super::decoder::{self, DecodeFailure};
use super::model::{PlayerReference, ResolvedStream};
use super::token;
use super::{ResolveOutcome, Resolver};
use crate::server::services::upstream_services::UpstreamService;

/// fetch the player html and unpack it, one request and no browser
pub struct StaticPageResolver {
    upstream: UpstreamService,
}

impl StaticPageResolver {
    pub fn new(upstream: UpstreamService) -> Self {
        Self { upstream }
    }

    /// packed script first, then a bare literal for pages that stopped packing
    pub fn stream_url_from_html(html: &str) -> Result<String, DecodeFailure> {
        match decoder::extract_stream_url(html) {
            Ok(url) => Ok(url),
            Err(DecodeFailure::NoMarker) => {
                decoder::find_stream_url(html).map_err(|_| DecodeFailure::NoMarker)
            }
            Err(e) => Err(e),
        }
    }

    fn session_cookie(&self, response: &reqwest::Response) -> Option<String> {
        let wanted = format!("{}=", self.upstream.config().session_cookie_name);

        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(str::trim)
            .find(|pair| pair.starts_with(&wanted))
            .map(str::to_string)
    }
}

#[async_trait]
impl Resolver for StaticPageResolver {
    fn name(&self) -> &'static str {
        "static-decoder"
    }

    async fn resolve(&self, player: &PlayerReference) -> ResolveOutcome {
        let response = match self.upstream.fetch_page(&player.player_url).await {
            Ok(response) => response,
            Err(e) => return ResolveOutcome::TryNext(format!("page fetch failed: {}", e)),
        };

        if !response.status().is_success() {
            return ResolveOutcome::TryNext(format!("page returned {}", response.status()));
        }

        let cookie = self.session_cookie(&response);

        let body = match UpstreamService::read_decoded(response).await {
            Ok(body) => body,
            Err(e) => return ResolveOutcome::TryNext(format!("page body unreadable: {}", e)),
        };
        let html = String::from_utf8_lossy(&body);

        let url = match Self::stream_url_from_html(&html) {
            Ok(url) => url,
            Err(e) => return ResolveOutcome::TryNext(e.to_string()),
        };

        // a token that's already dead means the page was cached somewhere, the browser will get a
        // fresh one
        if token::expiry_of(&url).is_some_and(|lifetime| lifetime.is_expired()) {
            warn!("decoded stream url carries an expired token, treating as stale");
            return ResolveOutcome::TryNext("decoded token is stale".to_string());
        }

        debug!("decoded stream url {}", url);

        let config = self.upstream.config();
        ResolveOutcome::Resolved(ResolvedStream {
            cookie,
            user_agent: Some(config.default_user_agent.clone()),
            referer: Some(config.default_referer()),
            ..ResolvedStream::direct(url)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_literal_is_accepted_when_page_is_not_packed() {
        let html = r#"<script>var src = "https://cdn.example/live/index.m3u8?token=a.9999999999.b";</script>"#;

        assert_eq!(
            StaticPageResolver::stream_url_from_html(html).unwrap(),
            "https://cdn.example/live/index.m3u8?token=a.9999999999.b"
        );
    }

    #[test]
    fn page_without_either_is_no_marker() {
        assert_eq!(
            StaticPageResolver::stream_url_from_html("<html></html>"),
            Err(DecodeFailure::NoMarker)
        );
    }
}
