use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;
use url::Url;

use super::proxy_url_utils::{Credentials, ProxyLinkBuilder};
use crate::server::error::{AppResult, Error};

static URI_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"URI="([^"]*)""#).expect("URI attribute pattern should compile"));

/// a reference that can't be resolved fails the whole manifest, passing it through would send the
/// player to the origin without the headers it needs
fn proxied(
    reference: &str,
    manifest_url: &Url,
    links: &ProxyLinkBuilder,
    credentials: &Credentials,
) -> AppResult<String> {
    let target = manifest_url.join(reference).map_err(|e| {
        error!("Failed to resolve: {} - {}", reference, e);
        Error::BadGateway(format!("unresolvable manifest reference: {}", reference))
    })?;

    Ok(links.link(links.route_for(&target), target.as_str(), credentials))
}

/// rewrite one line, `line` has no trailing `\n` but may still have a `\r`
fn rewrite_line(
    line: &str,
    manifest_url: &Url,
    links: &ProxyLinkBuilder,
    credentials: &Credentials,
) -> AppResult<String> {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return Ok(line.to_string());
    }

    if trimmed.starts_with('#') {
        if !trimmed.contains("URI=\"") {
            return Ok(line.to_string());
        }

        let mut rewritten = String::with_capacity(line.len() * 2);
        let mut last = 0;
        for caps in URI_ATTR_RE.captures_iter(line) {
            let (Some(whole), Some(value)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            rewritten.push_str(&line[last..whole.start()]);

            let reference = value.as_str().trim();
            if reference.is_empty() {
                rewritten.push_str(whole.as_str());
            } else {
                let link = proxied(reference, manifest_url, links, credentials)?;
                rewritten.push_str(&format!("URI=\"{}\"", link));
            }
            last = whole.end();
        }
        rewritten.push_str(&line[last..]);

        return Ok(rewritten);
    }

    let link = proxied(trimmed, manifest_url, links, credentials)?;
    if line.ends_with('\r') {
        Ok(format!("{}\r", link))
    } else {
        Ok(link)
    }
}

/// point every reference in the manifest back at the relay
///
/// lines are split on `\n` and joined the same way so the output has exactly as many lines as the
/// input, in the same order, and directive lines come out byte for byte
pub fn rewrite_manifest(
    text: &str,
    manifest_url: &Url,
    links: &ProxyLinkBuilder,
    credentials: &Credentials,
) -> AppResult<String> {
    Ok(text
        .split('\n')
        .map(|line| rewrite_line(line, manifest_url, links, credentials))
        .collect::<AppResult<Vec<_>>>()?
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links() -> ProxyLinkBuilder {
        ProxyLinkBuilder::new("http://127.0.0.1:8089")
    }

    #[test]
    fn key_uri_is_resolved_and_relayed_as_bytes() {
        let base = Url::parse("https://cdn.example/live/v1/index.m3u8").unwrap();
        let line = r#"#EXT-X-KEY:METHOD=AES-128,URI="../keys/k1.key",IV=0x01"#;

        let rewritten = rewrite_line(line, &base, &links(), &Credentials::default()).unwrap();

        assert_eq!(
            rewritten,
            r#"#EXT-X-KEY:METHOD=AES-128,URI="http://127.0.0.1:8089/segment?url=https%3A%2F%2Fcdn.example%2Flive%2Fkeys%2Fk1.key",IV=0x01"#
        );
    }

    #[test]
    fn rendition_uri_goes_through_segment_by_default() {
        let base = Url::parse("https://cdn.example/master.m3u8").unwrap();
        let line = r#"#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",URI="audio/index.m3u8""#;

        let rewritten = rewrite_line(line, &base, &links(), &Credentials::default()).unwrap();

        assert_eq!(
            rewritten,
            r#"#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",URI="http://127.0.0.1:8089/segment?url=https%3A%2F%2Fcdn.example%2Faudio%2Findex.m3u8""#
        );
    }

    #[test]
    fn variant_playlists_go_back_through_playlist_when_nested_playlists_are_on() {
        let base = Url::parse("https://cdn.example/master.m3u8").unwrap();
        let nested = links().with_nested_playlists(true);

        let rewritten = rewrite_line(
            "hi/index.m3u8?token=a.1.b",
            &base,
            &nested,
            &Credentials::default(),
        )
        .unwrap();

        assert!(rewritten.starts_with("http://127.0.0.1:8089/playlist?url="));
        assert!(rewritten.contains("https%3A%2F%2Fcdn.example%2Fhi%2Findex.m3u8%3Ftoken%3Da.1.b"));

        let rewritten = rewrite_line(
            "hi/index.m3u8?token=a.1.b",
            &base,
            &links(),
            &Credentials::default(),
        )
        .unwrap();
        assert!(rewritten.starts_with("http://127.0.0.1:8089/segment?url="));
    }

    #[test]
    fn absolute_references_are_kept_absolute() {
        let base = Url::parse("https://cdn.example/a/playlist.m3u8").unwrap();

        let rewritten = rewrite_line(
            "https://edge.other/seg/5.ts",
            &base,
            &links(),
            &Credentials::default(),
        )
        .unwrap();

        assert_eq!(
            rewritten,
            "http://127.0.0.1:8089/segment?url=https%3A%2F%2Fedge.other%2Fseg%2F5.ts"
        );
    }

    #[test]
    fn unresolvable_reference_fails_the_manifest() {
        let base = Url::parse("https://cdn.example/a/playlist.m3u8").unwrap();

        for text in [
            "#EXTINF:4.0,\nhttp://[broken/seg.ts",
            "#EXT-X-KEY:METHOD=AES-128,URI=\"http://[broken/k.key\"",
        ] {
            let err = rewrite_manifest(text, &base, &links(), &Credentials::default()).unwrap_err();
            assert!(matches!(err, Error::BadGateway(_)), "{}", text);
        }
    }

    #[test]
    fn carriage_returns_survive() {
        let base = Url::parse("https://cdn.example/a/playlist.m3u8").unwrap();
        let text = "#EXTM3U\r\n#EXTINF:4.0,\r\nseg.ts\r\n";

        let rewritten = rewrite_manifest(text, &base, &links(), &Credentials::default()).unwrap();
        let lines: Vec<&str> = rewritten.split('\n').collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "#EXTM3U\r");
        assert!(lines[2].ends_with(".ts\r"));
        assert_eq!(lines[3], "");
    }
}
