use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use streamrelay::AppConfig;
use streamrelay::resolver::{
    MockResolver, ResolutionFailure, ResolveOutcome, ResolvedStream, ResolverChain,
};
use streamrelay::server::{router, services::RelayServices};
use tokio::net::TcpListener;

type SeenHeaders = Arc<Mutex<Option<HeaderMap>>>;

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn live_playlist(State(seen): State<SeenHeaders>, headers: HeaderMap) -> impl IntoResponse {
    *seen.lock().unwrap() = Some(headers);
    (
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        "#EXTM3U\n#EXTINF:5.0,\nsegment1.ts",
    )
}

async fn segment() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "video/mp2t")], vec![0x47u8; 376])
}

async fn untyped_segment() -> Response {
    // no content type at all, the relay has to fill one in
    Response::new(Body::from(vec![0x47u8; 188]))
}

async fn zstd_segment() -> impl IntoResponse {
    let packed = zstd::encode_all(&[0x47u8; 376][..], 3).unwrap();
    (
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CONTENT_ENCODING, "zstd"),
        ],
        packed,
    )
}

async fn forbidden() -> impl IntoResponse {
    (StatusCode::FORBIDDEN, "token rejected")
}

struct Harness {
    relay_base: String,
    origin_base: String,
    seen: SeenHeaders,
    client: reqwest::Client,
}

async fn harness_with(chain: Option<ResolverChain>) -> Harness {
    let seen: SeenHeaders = Arc::new(Mutex::new(None));
    let origin = spawn(
        Router::new()
            .route("/live/playlist.m3u8", get(live_playlist))
            .route("/live/segment1.ts", get(segment))
            .route("/live/untyped.ts", get(untyped_segment))
            .route("/live/packed.ts", get(zstd_segment))
            .route("/live/expired.m3u8", get(forbidden))
            .route("/live/expired.ts", get(forbidden))
            .with_state(seen.clone()),
    )
    .await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let relay_base = format!("http://{}", relay_addr);

    let config = Arc::new(AppConfig::default());
    let services = match chain {
        Some(chain) => RelayServices::with_chain(config, relay_base.clone(), chain).unwrap(),
        None => RelayServices::new(config, relay_base.clone()).unwrap(),
    };
    let app = router(services);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        relay_base,
        origin_base: format!("http://{}", origin),
        seen,
        client: reqwest::Client::new(),
    }
}

async fn harness() -> Harness {
    harness_with(None).await
}

#[tokio::test]
async fn rewrite_the_live_playlist_through_the_relay() {
    let h = harness().await;
    let target = format!("{}/live/playlist.m3u8", h.origin_base);

    let response = h
        .client
        .get(format!("{}/playlist", h.relay_base))
        .query(&[("url", target.as_str()), ("cookie", "PHPSESSID=abc")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    assert!(response.headers().get(header::CONTENT_LENGTH).is_none());

    let body = response.text().await.unwrap();
    let lines: Vec<&str> = body.split('\n').collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "#EXTM3U");
    assert_eq!(lines[1], "#EXTINF:5.0,");
    assert_eq!(
        lines[2],
        format!(
            "{}/segment?url={}&cookie=PHPSESSID%3Dabc",
            h.relay_base,
            urlencoding::encode(&format!("{}/live/segment1.ts", h.origin_base))
        )
    );
}

#[tokio::test]
async fn present_as_the_embed_page_to_the_origin() {
    let h = harness().await;
    let target = format!("{}/live/playlist.m3u8", h.origin_base);

    h.client
        .get(format!("{}/playlist", h.relay_base))
        .query(&[("url", target.as_str()), ("cookie", "PHPSESSID=abc")])
        .send()
        .await
        .unwrap();

    let seen = h.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen[header::ORIGIN], "https://embedstreams.top");
    assert_eq!(seen[header::REFERER], "https://embedstreams.top/");
    assert_eq!(seen[header::COOKIE], "PHPSESSID=abc");
    assert_eq!(seen["sec-fetch-mode"], "cors");
    assert_eq!(seen["sec-fetch-site"], "cross-site");
    assert!(
        seen[header::USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("Mozilla/5.0")
    );
}

#[tokio::test]
async fn pass_through_the_origin_status_for_playlists() {
    let h = harness().await;
    let target = format!("{}/live/expired.m3u8", h.origin_base);

    let response = h
        .client
        .get(format!("{}/playlist", h.relay_base))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn pass_through_the_origin_status_for_segments() {
    let h = harness().await;
    let target = format!("{}/live/expired.ts", h.origin_base);

    let response = h
        .client
        .get(format!("{}/segment", h.relay_base))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stream_segment_bytes_unchanged() {
    let h = harness().await;
    let target = format!("{}/live/segment1.ts", h.origin_base);

    let response = h
        .client
        .get(format!("{}/segment", h.relay_base))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.bytes().await.unwrap().to_vec(), vec![0x47u8; 376]);
}

#[tokio::test]
async fn default_the_segment_content_type() {
    let h = harness().await;
    let target = format!("{}/live/untyped.ts", h.origin_base);

    let response = h
        .client
        .get(format!("{}/segment", h.relay_base))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.bytes().await.unwrap().to_vec(), vec![0x47u8; 188]);
}

#[tokio::test]
async fn decode_segments_for_players_that_did_not_ask_for_compression() {
    let h = harness().await;
    let target = format!("{}/live/packed.ts", h.origin_base);

    let response = h
        .client
        .get(format!("{}/segment", h.relay_base))
        .query(&[("url", target.as_str())])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(response.bytes().await.unwrap().to_vec(), vec![0x47u8; 376]);

    let response = h
        .client
        .get(format!("{}/segment", h.relay_base))
        .query(&[("url", target.as_str())])
        .header(header::ACCEPT_ENCODING, "gzip, deflate")
        .send()
        .await
        .unwrap();

    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(response.bytes().await.unwrap().to_vec(), vec![0x47u8; 376]);
}

#[tokio::test]
async fn keep_segment_compression_the_player_accepts() {
    let h = harness().await;
    let target = format!("{}/live/packed.ts", h.origin_base);

    let response = h
        .client
        .get(format!("{}/segment", h.relay_base))
        .query(&[("url", target.as_str())])
        .header(header::ACCEPT_ENCODING, "gzip, zstd")
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers()[header::CONTENT_ENCODING], "zstd");
    let body = response.bytes().await.unwrap();
    assert_eq!(zstd::decode_all(&body[..]).unwrap(), vec![0x47u8; 376]);
}

#[tokio::test]
async fn answer_bad_gateway_when_the_origin_is_unreachable() {
    let h = harness().await;

    // bind then drop so the port is known to be closed
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    for (route, path) in [("playlist", "live/playlist.m3u8"), ("segment", "live/segment1.ts")] {
        let target = format!("http://{}/{}", closed_addr, path);
        let response = h
            .client
            .get(format!("{}/{}", h.relay_base, route))
            .query(&[("url", target.as_str())])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY, "{}", route);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn reject_requests_without_a_target() {
    let h = harness().await;

    for route in ["playlist", "segment"] {
        let response = h
            .client
            .get(format!("{}/{}", h.relay_base, route))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = h
            .client
            .get(format!("{}/{}", h.relay_base, route))
            .query(&[("url", "not a url")])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn answer_preflight_requests() {
    let h = harness().await;

    let response = h
        .client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/playlist", h.relay_base),
        )
        .header(header::ORIGIN, "http://player.local")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert!(
        response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
    );
}

#[tokio::test]
async fn report_health() {
    let h = harness().await;

    let health: serde_json::Value = h
        .client
        .get(format!("{}/health", h.relay_base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "healthy");
    assert_eq!(health["relay_base"], h.relay_base.as_str());
}

fn chain_returning(outcome: ResolveOutcome) -> ResolverChain {
    let mut resolver = MockResolver::new();
    resolver.expect_name().return_const("mock");
    resolver
        .expect_resolve()
        .times(1)
        .returning(move |_| outcome.clone());
    ResolverChain::new(vec![Arc::new(resolver)])
}

#[tokio::test]
async fn hand_out_a_relay_link_for_a_resolved_player() {
    let stream = ResolvedStream {
        cookie: Some("PHPSESSID=abc".to_string()),
        ..ResolvedStream::direct("https://cdn.example/live/index.m3u8?token=a.4102444800.c".into())
    };
    let h = harness_with(Some(chain_returning(ResolveOutcome::Resolved(stream)))).await;

    let resolved: ResolvedStream = h
        .client
        .get(format!("{}/resolve", h.relay_base))
        .query(&[("player", "https://embedstreams.top/embed/alpha/1")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(
        resolved.raw_url,
        "https://cdn.example/live/index.m3u8?token=a.4102444800.c"
    );
    assert_eq!(
        resolved.stream_url,
        format!(
            "{}/playlist?url={}&cookie=PHPSESSID%3Dabc",
            h.relay_base,
            urlencoding::encode("https://cdn.example/live/index.m3u8?token=a.4102444800.c")
        )
    );
}

#[tokio::test]
async fn map_resolution_failures_to_gateway_statuses() {
    let cases = [
        (
            ResolveOutcome::Fatal(ResolutionFailure::Timeout),
            StatusCode::GATEWAY_TIMEOUT,
        ),
        (
            ResolveOutcome::TryNext("nothing observed".to_string()),
            StatusCode::BAD_GATEWAY,
        ),
    ];

    for (outcome, expected) in cases {
        let h = harness_with(Some(chain_returning(outcome))).await;

        let response = h
            .client
            .get(format!("{}/resolve", h.relay_base))
            .query(&[("player", "https://embedstreams.top/embed/alpha/1")])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), expected);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn reject_a_resolve_without_a_player() {
    let mut resolver = MockResolver::new();
    resolver.expect_name().return_const("mock");
    resolver.expect_resolve().times(0);
    let h = harness_with(Some(ResolverChain::new(vec![Arc::new(resolver)]))).await;

    let response = h
        .client
        .get(format!("{}/resolve", h.relay_base))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
