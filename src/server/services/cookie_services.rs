use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mockall::automock;
use tracing::debug;

pub type DynCookieStore = Arc<dyn CookieStore + Send + Sync>;

/// shared jar that the browser resolver writes harvested session cookies into
///
/// the proxy never reads from this on its own, the `cookie` query parameter is the only thing that
/// ends up on a relayed request
#[automock]
pub trait CookieStore {
    /// `name=value; name2=value2` for the domain, ready for a Cookie header
    fn get_cookies(&self, domain: &str) -> Option<String>;

    /// merge `Set-Cookie` style values (attributes are dropped), newer values win
    fn store_cookies(&self, domain: &str, cookies: &[String]);
}

#[derive(Default)]
pub struct InMemoryCookieStore {
    // domain -> (cookie name -> "name=value"), ordered by insertion for a stable header
    jar: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl InMemoryCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract_domain(url: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

impl CookieStore for InMemoryCookieStore {
    fn get_cookies(&self, domain: &str) -> Option<String> {
        let jar = self.jar.lock().unwrap_or_else(|e| e.into_inner());
        let cookies = jar.get(domain)?;

        if cookies.is_empty() {
            return None;
        }

        Some(
            cookies
                .iter()
                .map(|(_, pair)| pair.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn store_cookies(&self, domain: &str, cookies: &[String]) {
        if cookies.is_empty() {
            return;
        }

        let mut jar = self.jar.lock().unwrap_or_else(|e| e.into_inner());
        let entries = jar.entry(domain.to_string()).or_default();

        for cookie in cookies {
            // Set-Cookie format: name=value; attr1; attr2...
            // only want the name=value part
            let Some(cookie_value) = cookie.split(';').next() else {
                continue;
            };
            let Some((name, _)) = cookie_value.split_once('=') else {
                continue;
            };
            let name = name.trim().to_string();
            let pair = cookie_value.trim().to_string();

            match entries.iter_mut().find(|(existing, _)| *existing == name) {
                Some(entry) => entry.1 = pair,
                None => entries.push((name, pair)),
            }
        }

        debug!("stored {} cookies for domain {}", entries.len(), domain);
    }
}
