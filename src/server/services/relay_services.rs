use std::sync::Arc;

use tracing::info;

use crate::{
    config::AppConfig,
    resolver::{
        BrowserStreamResolver, DynResolver, ResolutionService, ResolverChain, StaticPageResolver,
    },
    server::{error::AppResult, utils::proxy_url_utils::ProxyLinkBuilder},
};

use super::{
    cookie_services::{DynCookieStore, InMemoryCookieStore},
    upstream_services::UpstreamService,
};

/// everything a handler needs, built once after the listener is bound and handed to the router
/// as an extension
#[derive(Clone)]
pub struct RelayServices {
    pub upstream: UpstreamService,
    pub links: ProxyLinkBuilder,
    pub cookies: DynCookieStore,
    pub resolution: Arc<ResolutionService>,
    pub browser: Arc<BrowserStreamResolver>,
    pub config: Arc<AppConfig>,
}

impl RelayServices {
    pub fn new(config: Arc<AppConfig>, public_base: String) -> AppResult<Self> {
        info!("starting relay services...");

        let upstream = UpstreamService::new(config.clone())?;
        let cookies = Arc::new(InMemoryCookieStore::new()) as DynCookieStore;

        let browser = Arc::new(BrowserStreamResolver::new(config.clone(), cookies.clone()));
        let chain = ResolverChain::new(vec![
            Arc::new(StaticPageResolver::new(upstream.clone())) as DynResolver,
            browser.clone() as DynResolver,
        ]);

        info!("resolver chain ok, relay links point at {}", public_base);
        let links =
            ProxyLinkBuilder::new(public_base).with_nested_playlists(config.nested_playlists);

        Ok(Self {
            upstream,
            links,
            cookies,
            resolution: Arc::new(ResolutionService::new(chain)),
            browser,
            config,
        })
    }

    /// same as `new` but with a caller supplied chain, tests use this to swap in mocks
    pub fn with_chain(
        config: Arc<AppConfig>,
        public_base: String,
        chain: ResolverChain,
    ) -> AppResult<Self> {
        let mut services = Self::new(config, public_base)?;
        services.resolution = Arc::new(ResolutionService::new(chain));
        Ok(services)
    }

    /// drop any live browser, called on shutdown
    pub fn shutdown(&self) {
        self.resolution.cancel();
        self.browser.cancel_active();
    }
}
