use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// remaining validity of a signed manifest url
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetime {
    pub expires_at: i64,
    pub remaining: Duration,
}

impl TokenLifetime {
    pub fn is_expired(&self) -> bool {
        self.remaining < Duration::zero()
    }
}

/// the `token` query value, read up to the next `&`
pub fn token_of(url: &str) -> Option<&str> {
    let start = url.find("token=")? + "token=".len();
    let rest = &url[start..];
    let value = rest.split('&').next().unwrap_or(rest);

    (!value.is_empty()).then_some(value)
}

/// field 1 of the dot separated token is the unix expiry
pub fn expiry_of_at(url: &str, now: DateTime<Utc>) -> Option<TokenLifetime> {
    let token = token_of(url)?;
    let expires_at: i64 = token.split('.').nth(1)?.trim().parse().ok()?;

    Some(TokenLifetime {
        expires_at,
        remaining: Duration::seconds(expires_at - now.timestamp()),
    })
}

pub fn expiry_of(url: &str) -> Option<TokenLifetime> {
    expiry_of_at(url, Utc::now())
}

/// diagnostic only, an expired token still gets played since the manifest usually refreshes it
pub fn log_expiry(url: &str) -> Option<TokenLifetime> {
    let lifetime = expiry_of(url);

    match lifetime {
        Some(l) if l.is_expired() => warn!(
            "stream token expired {}s ago (exp {})",
            -l.remaining.num_seconds(),
            l.expires_at
        ),
        Some(l) => debug!(
            "stream token valid for another {}s (exp {})",
            l.remaining.num_seconds(),
            l.expires_at
        ),
        None => debug!("stream url has no readable token expiry"),
    }

    lifetime
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_value_stops_at_next_param() {
        assert_eq!(
            token_of("https://cdn/x/index.m3u8?token=a.1700000000.c&foo=1"),
            Some("a.1700000000.c")
        );
        assert_eq!(token_of("https://cdn/x/index.m3u8?token="), None);
        assert_eq!(token_of("https://cdn/x/index.m3u8"), None);
    }

    #[test]
    fn non_numeric_expiry_is_unknown() {
        assert_eq!(expiry_of("https://cdn/index.m3u8?token=a.b.c"), None);
        assert_eq!(expiry_of("https://cdn/index.m3u8?token=single"), None);
    }
}
