// the two relay routes, the player only ever talks to these once it has a manifest link
use axum::{
    Extension, Router,
    body::{Body, Bytes},
    extract::Query,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::convert::Infallible;
use std::io::Write;

use flate2::{Compression, write::GzEncoder};
use tracing::{debug, error};

use crate::server::{
    error::{AppResult, Error},
    services::{RelayServices, SegmentStreamingRelay, UpstreamService},
    utils::{
        manifest_utils::rewrite_manifest,
        proxy_url_utils::{ProxyQuery, ProxyRequest},
    },
};

const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const DEFAULT_SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Supported compression encodings for rewritten manifests
#[derive(Debug, Clone, Copy, PartialEq)]
enum ContentEncoding {
    Zstd,
    Gzip,
    None,
}

impl ContentEncoding {
    /// apple's player sends "gzip, deflate" or "identity", identity has to be respected
    fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        match accept_encoding {
            Some(v) => {
                if v == "identity" || v.starts_with("identity,") {
                    return Self::None;
                }
                if v.contains("zstd") {
                    Self::Zstd
                } else if v.contains("gzip") {
                    Self::Gzip
                } else {
                    Self::None
                }
            }
            None => Self::None,
        }
    }

    fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::None => None,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::None => Ok(data.to_vec()),
        }
    }
}

/// whether the player's Accept-Encoding allows `encoding`, an explicit `q=0` refuses it
fn accepts_encoding(accept_encoding: Option<&str>, encoding: &str) -> bool {
    let Some(accept_encoding) = accept_encoding else {
        return false;
    };

    accept_encoding.split(',').any(|item| {
        let mut parts = item.split(';');
        let name = parts.next().unwrap_or_default().trim();
        let refused = parts.any(|param| {
            param
                .trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });

        !refused
            && (name == "*"
                || name.eq_ignore_ascii_case(encoding)
                || (encoding == "gzip" && name.eq_ignore_ascii_case("x-gzip")))
    })
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        Router::new()
            .route(
                "/playlist",
                get(Self::playlist_get).options(Self::proxy_options),
            )
            .route("/segment", get(Self::segment_get).options(Self::proxy_options))
    }

    /// live manifests change every few seconds, so the body goes out chunked with no length and
    /// no range support, the player has to refetch
    fn build_manifest_response(processed_body: String, headers: &HeaderMap) -> AppResult<Response> {
        let encoding = ContentEncoding::from_accept_encoding(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(MANIFEST_CONTENT_TYPE),
        );
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let response_body: Vec<u8> = match encoding.as_header_value() {
            Some(enc_header) => {
                let compressed = encoding.compress(processed_body.as_bytes()).map_err(|e| {
                    error!("Failed to compress response with {:?}: {}", encoding, e);
                    Error::InternalServerErrorWithContext("Failed to compress response".to_string())
                })?;
                debug!(
                    "Compressed manifest with {:?} from {} to {} bytes",
                    encoding,
                    processed_body.len(),
                    compressed.len()
                );
                response_headers.insert(
                    header::CONTENT_ENCODING,
                    HeaderValue::from_static(enc_header),
                );
                compressed
            }
            None => processed_body.into_bytes(),
        };

        let body = Body::from_stream(futures::stream::once(async move {
            Ok::<_, Infallible>(Bytes::from(response_body))
        }));

        Ok((StatusCode::OK, response_headers, body).into_response())
    }

    async fn playlist_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<ProxyQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let request = ProxyRequest::try_from(params)?;
        debug!("Proxying playlist: {}", request.target_url);

        let target_response = services.upstream.fetch(&request).await?;

        let response_status = target_response.status();
        if !response_status.is_success() {
            error!(
                "Playlist upstream {} answered {}",
                request.target_url, response_status
            );
            return Err(Error::Upstream(response_status));
        }

        // relative references resolve against where the manifest actually came from
        let manifest_url = target_response.url().clone();

        let body = UpstreamService::read_decoded(target_response).await?;
        let text = String::from_utf8(body).map_err(|e| {
            error!("Failed to parse m3u8 as UTF-8: {}", e);
            Error::BadGateway("Invalid m3u8 encoding".to_string())
        })?;

        let processed_body =
            rewrite_manifest(&text, &manifest_url, &services.links, &request.credentials)?;
        debug!(
            "Rewrote manifest {} ({} -> {} bytes)",
            manifest_url,
            text.len(),
            processed_body.len()
        );

        Self::build_manifest_response(processed_body, &headers)
    }

    async fn segment_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<ProxyQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let request = ProxyRequest::try_from(params)?;
        debug!("Proxying segment: {}", request.target_url);

        let target_response = services.upstream.fetch(&request).await?;

        let response_status = target_response.status();
        if !response_status.is_success() {
            error!(
                "Segment upstream {} answered {}",
                request.target_url, response_status
            );
            return Err(Error::Upstream(response_status));
        }

        let mut response_headers = HeaderMap::new();

        let content_type = target_response
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_SEGMENT_CONTENT_TYPE));
        response_headers.insert(header::CONTENT_TYPE, content_type);
        response_headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=300"),
        );

        let upstream_encoding = target_response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty() && v != "identity");

        if let Some(encoding) = upstream_encoding {
            let client_accepts = headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok());

            if !accepts_encoding(client_accepts, &encoding) {
                // the player never asked for this encoding, undo it here and send plain bytes
                debug!(
                    "Decoding {} segment for a client that accepts {:?}",
                    encoding, client_accepts
                );
                let body = UpstreamService::read_decoded(target_response).await?;
                return Ok((StatusCode::OK, response_headers, body).into_response());
            }

            // bytes go out exactly as they came in, so the encoding has to go with them
            let value = HeaderValue::from_str(&encoding).map_err(|_| {
                Error::BadGateway(format!("unusable upstream content-encoding: {}", encoding))
            })?;
            response_headers.insert(header::CONTENT_ENCODING, value);
        }

        let relay = SegmentStreamingRelay::register(target_response);

        Ok((
            StatusCode::OK,
            response_headers,
            Body::from_stream(relay.into_stream()),
        )
            .into_response())
    }

    async fn proxy_options() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }
}
