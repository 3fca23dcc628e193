use axum::{Extension, Json, Router, extract::Query, routing::get};
use serde::Deserialize;
use tracing::{info, warn};

use crate::resolver::{PlayerReference, ResolvedStream};
use crate::server::{
    error::{AppResult, Error},
    services::{RelayServices, cookie_services::InMemoryCookieStore},
    utils::proxy_url_utils::Credentials,
};

#[derive(Deserialize)]
struct ResolveQuery {
    player: Option<String>,
}

pub struct ResolveController;

impl ResolveController {
    pub fn app() -> Router {
        Router::new().route("/resolve", get(Self::resolve_get))
    }

    /// wrap a resolved origin manifest in a /playlist link that carries everything the origin
    /// wants, falling back to the jar for the cookie when the resolver didn't return one
    pub fn into_relayed(stream: ResolvedStream, services: &RelayServices) -> ResolvedStream {
        let cookie = stream.cookie.clone().or_else(|| {
            InMemoryCookieStore::extract_domain(&stream.raw_url)
                .and_then(|domain| services.cookies.get_cookies(&domain))
        });

        let credentials = Credentials {
            cookie: cookie.clone(),
            user_agent: stream.user_agent.clone(),
            referer: stream.referer.clone(),
        };

        ResolvedStream {
            stream_url: services.links.playlist(&stream.raw_url, &credentials),
            cookie,
            ..stream
        }
    }

    async fn resolve_get(
        Extension(services): Extension<RelayServices>,
        Query(query): Query<ResolveQuery>,
    ) -> AppResult<Json<ResolvedStream>> {
        let player_url = query
            .player
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::BadRequest("missing player parameter".to_string()))?;

        url::Url::parse(&player_url)
            .map_err(|e| Error::BadRequest(format!("invalid player parameter: {}", e)))?;

        let player = PlayerReference::new(player_url);
        info!("resolving {}", player.player_url);

        let stream = services.resolution.resolve(&player).await.map_err(|e| {
            warn!("could not load stream for {}: {}", player.player_url, e);
            Error::from(e)
        })?;

        Ok(Json(Self::into_relayed(stream, &services)))
    }
}
