use std::time::Duration;

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser, Debug, Clone)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum, default_value = "development")]
    pub cargo_env: CargoEnv,

    // first port of the bind window, the relay walks up from here until one binds
    #[clap(long, env, default_value = "8089")]
    pub port: u16,

    // how many ports to try before giving up
    #[clap(long, env, default_value = "10")]
    pub port_window: u16,

    // host (or ip) that other devices on the network can reach us on, a cast receiver can't
    // fetch from 127.0.0.1 so this has to be set for casting
    #[clap(long, env)]
    pub public_host: Option<String>,

    // if no public host is given, work out the lan address and advertise that instead of loopback
    #[clap(long, env, default_value_t = false)]
    pub advertise_lan: bool,

    // scheme + host of the site that embeds the player, sent as Origin and used as the default
    // Referer root
    #[clap(long, env, default_value = "https://embedstreams.top")]
    pub source_origin: String,

    // desktop ua, the player hands out different tokens to mobile clients
    #[clap(
        long,
        env,
        default_value = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
    )]
    pub default_user_agent: String,

    // session cookie the player sets, this is what the browser resolver harvests
    #[clap(long, env, default_value = "PHPSESSID")]
    pub session_cookie_name: String,

    // route .m3u8 references in a manifest through /playlist so master playlists get their
    // variants rewritten too, off means every reference goes through /segment
    #[clap(long, env, default_value_t = false)]
    pub nested_playlists: bool,

    #[clap(long, env, default_value = "12")]
    pub upstream_timeout_secs: u64,

    #[clap(long, env, default_value = "18")]
    pub resolve_timeout_secs: u64,

    // optional path to chrome/chromium, otherwise it gets auto detected
    #[clap(long, env)]
    pub chrome_executable: Option<String>,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// referer sent when the caller didn't give one, always the source root with a trailing slash
    pub fn default_referer(&self) -> String {
        format!("{}/", self.source_origin.trim_end_matches('/'))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

impl Default for AppConfig {
    // mostly for tests, the real thing always goes through clap
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 8089,
            port_window: 10,
            public_host: None,
            advertise_lan: false,
            source_origin: "https://embedstreams.top".to_string(),
            default_user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            session_cookie_name: "PHPSESSID".to_string(),
            nested_playlists: false,
            upstream_timeout_secs: 12,
            resolve_timeout_secs: 18,
            chrome_executable: None,
            sentry_dsn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_referer_has_single_trailing_slash() {
        let mut config = AppConfig::default();
        assert_eq!(config.default_referer(), "https://embedstreams.top/");

        config.source_origin = "https://example.org/".to_string();
        assert_eq!(config.default_referer(), "https://example.org/");
    }
}
