pub mod api;
pub mod error;
pub mod services;
pub mod utils;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, routing::get};
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AppConfig;
use api::{
    health_controller::health_endpoint, proxy_controller::ProxyController,
    resolve_controller::ResolveController,
};
use error::{AppResult, Error};
use services::RelayServices;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// address other devices on the lan reach us on, found by asking the os which interface it would
/// route an outbound packet through (nothing is actually sent)
pub fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();

    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

/// base for every link we hand out, has to be something the player (or a cast receiver on the same
/// network) can actually reach
pub fn public_base(config: &AppConfig, port: u16) -> String {
    if let Some(host) = config.public_host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        if host.starts_with("http://") || host.starts_with("https://") {
            return host.trim_end_matches('/').to_string();
        }
        return format!("http://{}:{}", host, port);
    }

    if config.advertise_lan {
        match lan_address() {
            Some(ip) => return format!("http://{}:{}", ip, port),
            None => warn!("no lan address found, advertising loopback"),
        }
    }

    format!("http://{}:{}", Ipv4Addr::LOCALHOST, port)
}

/// first port in the window that binds, port 0 means let the os pick
pub async fn bind_first_available(start: u16, window: u16) -> AppResult<TcpListener> {
    if start == 0 {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|_| Error::RelayUnavailable(0, 0));
    }

    let end = start.saturating_add(window.max(1));
    for port in start..end {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!("port {} unavailable: {}", port, e),
        }
    }

    Err(Error::RelayUnavailable(start, end))
}

pub fn router(services: RelayServices) -> Router {
    Router::new()
        .merge(ProxyController::app())
        .merge(ResolveController::app())
        .route("/health", get(health_endpoint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(Extension(services)),
        )
}

pub struct RelayApplicationServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    services: RelayServices,
}

impl RelayApplicationServer {
    pub async fn bind(config: Arc<AppConfig>) -> AppResult<Self> {
        let listener = bind_first_available(config.port, config.port_window).await?;
        let local_addr = listener.local_addr().map_err(|e| {
            Error::InternalServerErrorWithContext(format!("bound listener has no address: {}", e))
        })?;

        let base = public_base(&config, local_addr.port());
        let services = RelayServices::new(config, base)?;

        Ok(Self {
            listener,
            local_addr,
            services,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_base(&self) -> &str {
        self.services.links.base()
    }

    pub fn services(&self) -> &RelayServices {
        &self.services
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // touch it so uptime counts from here
        Lazy::force(&START_TIME);

        info!(
            "relay listening on {} (links use {})",
            self.local_addr,
            self.services.links.base()
        );

        let services = self.services.clone();
        let app = router(self.services);

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server stopped unexpectedly")?;

        info!("relay shutting down, dropping any live browser");
        services.shutdown();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_host_wins_over_loopback() {
        let mut config = AppConfig::default();
        assert_eq!(public_base(&config, 8090), "http://127.0.0.1:8090");

        config.public_host = Some("192.168.1.20".to_string());
        assert_eq!(public_base(&config, 8090), "http://192.168.1.20:8090");

        config.public_host = Some("https://relay.example/".to_string());
        assert_eq!(public_base(&config, 8090), "https://relay.example");
    }

    #[tokio::test]
    async fn walks_the_window_when_the_first_port_is_taken() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        match bind_first_available(port, 10).await {
            Ok(listener) => assert_ne!(listener.local_addr().unwrap().port(), port),
            // the neighbouring ports can be taken on a busy box, that's the failure we report
            Err(e) => assert!(matches!(e, Error::RelayUnavailable(..))),
        }
    }

    #[tokio::test]
    async fn exhausted_window_is_relay_unavailable() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = bind_first_available(port, 1).await.unwrap_err();
        assert!(matches!(err, Error::RelayUnavailable(p, _) if p == port));
    }
}
