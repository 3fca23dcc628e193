use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use flate2::read::{GzDecoder, ZlibDecoder};
use tracing::{debug, error};

use crate::config::AppConfig;
use crate::server::error::{AppResult, Error};
use crate::server::utils::proxy_url_utils::ProxyRequest;

// what we tell the origin we accept, everything in here has to be undone in `decode_body`
const ACCEPT_ENCODING: &str = "gzip, deflate, zstd";

/// every request that leaves the relay goes through here so the header profile stays the same
/// as the desktop browser the tokens were minted for
#[derive(Clone)]
pub struct UpstreamService {
    http: reqwest::Client,
    config: Arc<AppConfig>,
}

impl UpstreamService {
    pub fn new(config: Arc<AppConfig>) -> AppResult<Self> {
        // no cookie store on purpose, the cookie query param is the only cookie that goes out
        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!("failed to build upstream client: {}", e);
                Error::InternalServerErrorWithContext(format!("failed to build http client: {}", e))
            })?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn origin(&self) -> &str {
        self.config.source_origin.trim_end_matches('/')
    }

    /// manifest/segment/key fetch, cors style like the player's own hls.js requests
    pub fn apply_spoofed_headers(
        &self,
        request_builder: reqwest::RequestBuilder,
        request: &ProxyRequest,
    ) -> reqwest::RequestBuilder {
        let credentials = &request.credentials;
        let referer = credentials
            .referer
            .clone()
            .unwrap_or_else(|| self.config.default_referer());
        let user_agent = credentials
            .user_agent
            .as_deref()
            .unwrap_or(&self.config.default_user_agent);

        let mut request_builder = request_builder
            .header(header::ORIGIN, self.origin())
            .header(header::REFERER, referer)
            .header(header::USER_AGENT, user_agent)
            .header(header::ACCEPT, "*/*")
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(header::ACCEPT_ENCODING, ACCEPT_ENCODING)
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "cross-site")
            .header(header::PRAGMA, "no-cache")
            .header(header::CACHE_CONTROL, "no-cache");

        if let Some(cookie) = &credentials.cookie {
            request_builder = request_builder.header(header::COOKIE, cookie);
        }

        request_builder
    }

    pub async fn fetch(&self, request: &ProxyRequest) -> AppResult<reqwest::Response> {
        debug!("upstream GET {}", request.target_url);

        let request_builder =
            self.apply_spoofed_headers(self.http.get(request.target_url.clone()), request);

        request_builder.send().await.map_err(|e| {
            error!("Request failed: {}", e);
            Error::from(e)
        })
    }

    /// top level navigation to a player page, what the iframe load looks like in a browser
    pub async fn fetch_page(&self, page_url: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.http
            .get(page_url)
            .header(header::USER_AGENT, &self.config.default_user_agent)
            .header(header::REFERER, self.config.default_referer())
            .header(
                header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(header::ACCEPT_ENCODING, ACCEPT_ENCODING)
            .header("Sec-Fetch-Dest", "iframe")
            .header("Sec-Fetch-Mode", "navigate")
            .header("Sec-Fetch-Site", "cross-site")
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await
    }

    /// whole body, undoing whatever content-encoding the origin picked
    pub async fn read_decoded(response: reqwest::Response) -> AppResult<Vec<u8>> {
        let content_encoding = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_ascii_lowercase());

        let bytes = response.bytes().await.map_err(|e| {
            error!("Failed to read response: {}", e);
            Error::from(e)
        })?;

        decode_body(&bytes, content_encoding.as_deref()).map_err(|e| {
            error!("Failed to decompress {:?} response: {}", content_encoding, e);
            Error::BadGateway("Failed to decompress response".to_string())
        })
    }
}

pub fn decode_body(bytes: &[u8], content_encoding: Option<&str>) -> std::io::Result<Vec<u8>> {
    match content_encoding {
        Some("zstd") => zstd::decode_all(bytes),
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        Some("deflate") => {
            let mut decoded = Vec::new();
            ZlibDecoder::new(bytes).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        _ => Ok(bytes.to_vec()),
    }
}
