//! Fallback resolver: load the player page in a throwaway chrome and wait for the player's own
//! script to ask for the manifest.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetExtraHttpHeadersParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use futures::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{PlayerReference, ResolvedStream};
use super::{ResolutionFailure, ResolveOutcome, Resolver};
use crate::config::AppConfig;
use crate::server::services::cookie_services::{DynCookieStore, InMemoryCookieStore};

/// page side callback installed with Runtime.addBinding, survives navigations
const REPORT_BINDING: &str = "__relayReportStream";

/// runs before any page script, reports every manifest url the player touches through xhr,
/// fetch or a src attribute
pub const INSTRUMENTATION: &str = r#"(() => {
  const report = (value) => {
    try {
      if (typeof value !== 'string' || value.indexOf('.m3u8') === -1) return;
      window.__relayReportStream(new URL(value, location.href).href);
    } catch (e) {}
  };

  const open = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    report(String(url));
    return open.apply(this, arguments);
  };

  if (window.fetch) {
    const originalFetch = window.fetch;
    window.fetch = function (input, init) {
      report(typeof input === 'string' ? input : (input && input.url) || String(input));
      return originalFetch.apply(this, arguments);
    };
  }

  const scan = (node) => {
    if (node && node.getAttribute) {
      const src = node.getAttribute('src');
      if (src) report(src);
    }
  };

  const observer = new MutationObserver((mutations) => {
    for (const mutation of mutations) {
      if (mutation.type === 'attributes') scan(mutation.target);
      for (const node of mutation.addedNodes || []) {
        scan(node);
        if (node.querySelectorAll) node.querySelectorAll('[src]').forEach(scan);
      }
    }
  });

  const start = () => {
    document.querySelectorAll('video, [src]').forEach(scan);
    observer.observe(document.documentElement, {
      subtree: true,
      childList: true,
      attributes: true,
      attributeFilter: ['src'],
    });
  };

  if (document.documentElement) start();
  else document.addEventListener('DOMContentLoaded', start);
})();"#;

/// the player redirects itself mid load, chrome reports that as an aborted navigation even though
/// the instrumentation keeps running
pub fn is_navigation_cancelled(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("err_aborted")
        || message.contains("navigation cancelled")
        || message.contains("navigation canceled")
        || message.contains("frame was detached")
}

/// `name=value` of the session cookie if chrome has it
pub fn session_cookie_pair<'a>(
    cookies: impl IntoIterator<Item = (&'a str, &'a str)>,
    wanted: &str,
) -> Option<String> {
    cookies
        .into_iter()
        .find(|(name, _)| *name == wanted)
        .map(|(name, value)| format!("{}={}", name, value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserResolution {
    pub url: String,
    pub cookie: Option<String>,
    pub user_agent: String,
}

/// one chrome process with one page, torn down on drop
struct BrowserSurface {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

impl BrowserSurface {
    async fn launch(config: &AppConfig, generation: u64) -> Result<Self, ResolutionFailure> {
        let profile_dir = std::env::temp_dir().join(format!(
            "streamrelay-browser-{}-{}",
            std::process::id(),
            generation
        ));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1280, 720)
            .user_data_dir(&profile_dir)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--mute-audio")
            .arg("--autoplay-policy=no-user-gesture-required")
            .arg(format!("--user-agent={}", config.default_user_agent));

        if let Some(executable) = &config.chrome_executable {
            builder = builder.chrome_executable(executable);
        }

        let browser_config = builder
            .build()
            .map_err(|e| ResolutionFailure::Browser(format!("bad browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| ResolutionFailure::Browser(format!("failed to launch chrome: {}", e)))?;

        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(ResolutionFailure::Browser(format!(
                    "failed to open page: {}",
                    e
                )));
            }
        };

        Ok(Self {
            browser,
            page,
            handler,
            profile_dir,
        })
    }

    async fn close(mut self) {
        if let Err(e) = self.page.clone().close().await {
            debug!("page close failed: {}", e);
        }
        if let Err(e) = self.browser.close().await {
            debug!("browser close failed: {}", e);
        }
        let _ = self.browser.wait().await;
    }
}

impl Drop for BrowserSurface {
    fn drop(&mut self) {
        // chromiumoxide kills the child process when the Browser drops
        self.handler.abort();
        let _ = std::fs::remove_dir_all(&self.profile_dir);
    }
}

struct ActiveResolution {
    generation: u64,
    cancel: CancellationToken,
}

/// at most one live browser per resolver, starting a resolution cancels the running one and
/// waits for its surface to be gone before launching a new one
pub struct BrowserStreamResolver {
    config: Arc<AppConfig>,
    cookies: DynCookieStore,
    active: Mutex<Option<ActiveResolution>>,
    surface_slot: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl BrowserStreamResolver {
    pub fn new(config: Arc<AppConfig>, cookies: DynCookieStore) -> Self {
        Self {
            config,
            cookies,
            active: Mutex::new(None),
            surface_slot: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub async fn resolve_stream(
        &self,
        player: &PlayerReference,
    ) -> Result<BrowserResolution, ResolutionFailure> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        let previous = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(ActiveResolution {
                generation,
                cancel: cancel.clone(),
            });
        if let Some(previous) = previous {
            info!(
                "browser resolution {} supersedes {}",
                generation, previous.generation
            );
            previous.cancel.cancel();
        }

        let _slot = tokio::select! {
            _ = cancel.cancelled() => return Err(ResolutionFailure::Superseded),
            slot = self.surface_slot.lock() => slot,
        };

        let timeout = self.config.resolve_timeout();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolutionFailure::Superseded),
            outcome = tokio::time::timeout(timeout, self.run(player, generation)) => {
                outcome.unwrap_or_else(|_| {
                    warn!("no manifest seen on {} within {:?}", player.player_url, timeout);
                    Err(ResolutionFailure::Timeout)
                })
            }
        };

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|a| a.generation == generation) {
            *active = None;
        }

        result
    }

    /// stop whatever is loading, used on playback stop and shutdown
    pub fn cancel_active(&self) {
        if let Some(active) = self.active.lock().unwrap_or_else(|e| e.into_inner()).take() {
            debug!("tearing down browser resolution {}", active.generation);
            active.cancel.cancel();
        }
    }

    async fn run(
        &self,
        player: &PlayerReference,
        generation: u64,
    ) -> Result<BrowserResolution, ResolutionFailure> {
        let surface = BrowserSurface::launch(&self.config, generation).await?;
        let page = &surface.page;
        let cdp = |e: chromiumoxide::error::CdpError| ResolutionFailure::Browser(e.to_string());

        page.execute(SetUserAgentOverrideParams::new(
            self.config.default_user_agent.clone(),
        ))
        .await
        .map_err(cdp)?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(
            json!({ "Referer": self.config.default_referer() }),
        )))
        .await
        .map_err(cdp)?;
        page.execute(AddBindingParams::new(REPORT_BINDING))
            .await
            .map_err(cdp)?;

        let mut reports = page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(cdp)?;
        page.evaluate_on_new_document(INSTRUMENTATION)
            .await
            .map_err(cdp)?;

        debug!("browser {} loading {}", generation, player.player_url);

        // the navigation future borrows the page, keep it scoped so the surface can be closed
        let url = {
            let navigation = page.goto(player.player_url.as_str());
            tokio::pin!(navigation);
            let mut navigating = true;

            loop {
                tokio::select! {
                    result = &mut navigation, if navigating => {
                        navigating = false;
                        match result {
                            Ok(_) => debug!("player page loaded, waiting for the player to fetch"),
                            Err(e) if is_navigation_cancelled(&e.to_string()) => {
                                warn!("navigation cancelled, still listening: {}", e);
                            }
                            Err(e) => {
                                return Err(ResolutionFailure::Browser(format!("navigation failed: {}", e)));
                            }
                        }
                    }
                    event = reports.next() => match event {
                        Some(event) if event.name == REPORT_BINDING && event.payload.contains(".m3u8") => {
                            break event.payload.clone();
                        }
                        Some(_) => {}
                        None => {
                            return Err(ResolutionFailure::Browser("page event stream closed".to_string()));
                        }
                    }
                }
            }
        };

        info!("browser {} observed manifest {}", generation, url);

        let cookies = page.get_cookies().await.unwrap_or_default();
        let cookie = session_cookie_pair(
            cookies.iter().map(|c| (c.name.as_str(), c.value.as_str())),
            &self.config.session_cookie_name,
        );

        if let Some(pair) = &cookie {
            for domain in [&player.player_url, &url]
                .into_iter()
                .filter_map(|u| InMemoryCookieStore::extract_domain(u))
            {
                self.cookies.store_cookies(&domain, std::slice::from_ref(pair));
            }
        }

        let user_agent = match page.evaluate("navigator.userAgent").await {
            Ok(result) => result
                .into_value::<String>()
                .unwrap_or_else(|_| self.config.default_user_agent.clone()),
            Err(_) => self.config.default_user_agent.clone(),
        };

        surface.close().await;

        Ok(BrowserResolution {
            url,
            cookie,
            user_agent,
        })
    }
}

#[async_trait]
impl Resolver for BrowserStreamResolver {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn resolve(&self, player: &PlayerReference) -> ResolveOutcome {
        match self.resolve_stream(player).await {
            Ok(resolution) => ResolveOutcome::Resolved(ResolvedStream {
                cookie: resolution.cookie,
                user_agent: Some(resolution.user_agent),
                referer: Some(self.config.default_referer()),
                ..ResolvedStream::direct(resolution.url)
            }),
            Err(ResolutionFailure::Browser(reason)) => ResolveOutcome::TryNext(reason),
            Err(failure) => ResolveOutcome::Fatal(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_navigations_are_recognised() {
        assert!(is_navigation_cancelled(
            "Navigation failed: net::ERR_ABORTED at https://player.example"
        ));
        assert!(is_navigation_cancelled("Navigation cancelled"));
        assert!(!is_navigation_cancelled("net::ERR_NAME_NOT_RESOLVED"));
    }

    #[test]
    fn picks_the_configured_session_cookie() {
        let cookies = [("cf_clearance", "x"), ("PHPSESSID", "abc123")];

        assert_eq!(
            session_cookie_pair(cookies, "PHPSESSID").as_deref(),
            Some("PHPSESSID=abc123")
        );
        assert_eq!(session_cookie_pair(cookies, "missing"), None);
    }

    #[test]
    fn instrumentation_reports_through_the_binding() {
        assert!(INSTRUMENTATION.contains(REPORT_BINDING));
        assert!(INSTRUMENTATION.contains("XMLHttpRequest.prototype.open"));
        assert!(INSTRUMENTATION.contains("MutationObserver"));
    }

    #[tokio::test]
    async fn cancelling_with_nothing_active_is_a_no_op() {
        let resolver = BrowserStreamResolver::new(
            Arc::new(AppConfig::default()),
            Arc::new(InMemoryCookieStore::new()),
        );
        resolver.cancel_active();
        assert!(resolver.active.lock().unwrap().is_none());
    }
}
