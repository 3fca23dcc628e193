//! Static decoder for the packer the player pages wrap their setup script in.
//!
//! The packed call looks like `eval(function(h,u,n,t,e,r){...}("<payload>",41,"<charset>",7,3,52))`.
//! The payload is a list of words separated by `charset[base]`, every word is a number written
//! with `charset` as the digit alphabet, and `number - offset` is one code point of the script.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// call site of the packer, the payload string starts right after it
const CALL_MARKER: &str = "}(\"";
/// end of the payload string literal
const PAYLOAD_END: &str = "\",";
/// how much text after the payload gets searched for the parameter tuple
const PARAM_WINDOW: usize = 100;

static PARAMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"",\s*(\d+)\s*,\s*"([^"]+)"\s*,\s*(\d+)\s*,\s*(\d+)\s*,\s*(\d+)"#)
        .expect("packer parameter pattern should compile")
});

static STREAM_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"["']([^"']*index\.m3u8\?token=[^"']+)["']"#)
        .expect("stream url pattern should compile")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("packer call site not found")]
    NoMarker,
    #[error("packer parameters not found after payload")]
    NoParams,
    #[error("packed payload is malformed: {0}")]
    Malformed(String),
    #[error("no stream url in decoded script")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackerParams {
    pub charset: Vec<char>,
    pub offset: u32,
    pub base: u32,
}

/// payload span plus the parameters that were found behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedScript<'a> {
    pub payload: &'a str,
    pub params: PackerParams,
}

impl PackerParams {
    fn separator(&self) -> char {
        self.charset[self.base as usize]
    }

    fn digit(&self, c: char) -> Result<u64, DecodeFailure> {
        match self.charset.iter().position(|&d| d == c) {
            Some(index) if (index as u32) < self.base => Ok(index as u64),
            Some(index) => Err(DecodeFailure::Malformed(format!(
                "digit '{}' has value {} which is out of range for base {}",
                c, index, self.base
            ))),
            None => Err(DecodeFailure::Malformed(format!(
                "'{}' is not part of the charset",
                c
            ))),
        }
    }

    /// digits are weighted left to right, the first digit is the least significant one
    fn word_value(&self, word: &str) -> Result<u64, DecodeFailure> {
        let base = self.base as u64;

        // horner from the right end so the leftmost digit ends up with weight 1
        word.chars().rev().try_fold(0u64, |value, c| {
            let digit = self.digit(c)?;
            value
                .checked_mul(base)
                .and_then(|v| v.checked_add(digit))
                .ok_or_else(|| DecodeFailure::Malformed(format!("word '{}' overflows", word)))
        })
    }
}

/// marker scan -> payload span -> parameter tuple
pub fn parse(html: &str) -> Result<PackedScript<'_>, DecodeFailure> {
    let start = html.find(CALL_MARKER).ok_or(DecodeFailure::NoMarker)? + CALL_MARKER.len();
    let rest = &html[start..];

    let payload_len = rest.find(PAYLOAD_END).ok_or(DecodeFailure::NoParams)?;
    let payload = &rest[..payload_len];

    let after_payload = &rest[payload_len..];
    let window_end = after_payload
        .char_indices()
        .nth(PARAM_WINDOW)
        .map(|(i, _)| i)
        .unwrap_or(after_payload.len());
    let window = &after_payload[..window_end];

    let caps = PARAMS_RE.captures(window).ok_or(DecodeFailure::NoParams)?;

    let charset: Vec<char> = caps[2].chars().collect();
    let offset: u32 = caps[3].parse().map_err(|_| DecodeFailure::NoParams)?;
    let base: u32 = caps[4].parse().map_err(|_| DecodeFailure::NoParams)?;

    if base < 2 || base as usize >= charset.len() {
        return Err(DecodeFailure::Malformed(format!(
            "base {} does not fit a charset of {} characters",
            base,
            charset.len()
        )));
    }

    Ok(PackedScript {
        payload,
        params: PackerParams {
            charset,
            offset,
            base,
        },
    })
}

/// a `%` without two hex digits after it, which the page side unescape rejects outright
fn has_malformed_escape(text: &str) -> bool {
    let bytes = text.as_bytes();

    bytes.iter().enumerate().any(|(i, &b)| {
        b == b'%'
            && !(bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit))
    })
}

/// unpack the player script embedded in `html`
pub fn decode(html: &str) -> Result<String, DecodeFailure> {
    let packed = parse(html)?;
    let params = &packed.params;

    debug!(
        "unpacking {} chars with base {} offset {}",
        packed.payload.len(),
        params.base,
        params.offset
    );

    let mut raw = String::with_capacity(packed.payload.len() / 2);
    for word in packed.payload.split(params.separator()) {
        if word.is_empty() {
            continue;
        }

        let value = params.word_value(word)?;
        let code_point = value
            .checked_sub(params.offset as u64)
            .and_then(|v| u32::try_from(v).ok())
            .and_then(char::from_u32)
            .ok_or_else(|| {
                DecodeFailure::Malformed(format!("{} is not a code point after offset", value))
            })?;
        raw.push(code_point);
    }

    // the packer escapes the script before encoding it, but not always, so a bad escape just
    // means the raw text is the script
    if has_malformed_escape(&raw) {
        return Ok(raw);
    }

    Ok(match urlencoding::decode(&raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw,
    })
}

/// first quoted `index.m3u8?token=` url in the script
pub fn find_stream_url(script: &str) -> Result<String, DecodeFailure> {
    STREAM_URL_RE
        .captures(script)
        .map(|caps| caps[1].to_string())
        .ok_or(DecodeFailure::NotFound)
}

/// decode then search, what the static resolver actually calls
pub fn extract_stream_url(html: &str) -> Result<String, DecodeFailure> {
    let script = decode(html)?;
    find_stream_url(&script)
}
