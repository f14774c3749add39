//! Makes an upstream response usable under the public `/h/<tunnel-id>/` mount.
//!
//! HTML rewriting is pattern based, not a parser. It only sees attribute
//! values, so URLs built by scripts or embedded in inline JSON are left
//! alone, and attribute-like text inside `<script>` or comments may be
//! rewritten.

use std::borrow::Cow;
use std::io::{self, Read};
use std::str::FromStr;

use actix_web::http::Uri;
use flate2::read::{GzDecoder, ZlibDecoder};
use regex::bytes::{Captures, Regex};

use crate::common::error::ConfigError;

const REWRITTEN_ATTRIBUTES: &str = "href|src|action|data-href|data-src|srcset";

pub struct ResponseRewriter {
    prefix: String,
    base_tag: Regex,
    head_tag: Regex,
    attribute: Regex,
}

impl ResponseRewriter {

    pub fn new(tunnel_id: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            prefix: format!("/h/{}", tunnel_id),
            base_tag: Regex::new(r"(?i)<base\b[^>]*>")?,
            head_tag: Regex::new(r"(?i)<head\b[^>]*>")?,
            attribute: Regex::new(&format!(
                r#"(?i)(\s(?:{})\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#,
                REWRITTEN_ATTRIBUTES
            ))?,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn is_prefixed(&self, path: &str) -> bool {
        match path.strip_prefix(&self.prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with(|c: char| c == '/' || c == '?' || c == '#'),
            None => false,
        }
    }

    /// `/x` → `/h/<id>/x`. Protocol-relative (`//host`) and already prefixed
    /// values come back as `None`.
    pub fn prefix_path(&self, path: &str) -> Option<String> {
        if !path.starts_with('/') || path.starts_with("//") || self.is_prefixed(path) {
            return None;
        }
        Some(format!("{}{}", self.prefix, path))
    }

    /// Root-relative redirects get the prefix; absolute redirects back to the
    /// upstream itself become root-relative. Anything else is kept.
    pub fn rewrite_location(&self, location: &str, upstream_host: &str) -> Option<String> {
        if location.starts_with('/') {
            return self.prefix_path(location);
        }
        let (url, fragment) = match location.split_once('#') {
            Some((url, fragment)) => (url, Some(fragment)),
            None => (location, None),
        };
        let uri = Uri::from_str(url).ok()?;
        uri.scheme()?;
        if !uri.host()?.eq_ignore_ascii_case(upstream_host) {
            return None;
        }
        let mut path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/").to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(fragment) = fragment {
            path.push('#');
            path.push_str(fragment);
        }
        Some(self.prefix_path(&path).unwrap_or(path))
    }

    /// Scopes a cookie to the tunnel mount. Returns the input untouched when
    /// nothing had to change, so rewriting twice is the same as once.
    pub fn rewrite_set_cookie<'a>(&self, cookie: &'a str) -> Cow<'a, str> {
        let mut changed = false;
        let mut same_site_none = false;
        let mut secure = false;
        let mut parts: Vec<String> = Vec::new();

        for (index, part) in cookie.split(';').enumerate() {
            let part = part.trim();
            if index == 0 {
                parts.push(part.to_string());
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (part, None),
            };
            match (name.to_ascii_lowercase().as_str(), value) {
                ("domain", _) => {
                    changed = true;
                    continue;
                }
                ("path", Some(path)) => {
                    if let Some(prefixed) = self.prefix_path(path) {
                        changed = true;
                        // A root cookie path covers the whole mount, including `/h/<id>` itself.
                        let prefixed = if path == "/" { self.prefix.clone() } else { prefixed };
                        parts.push(format!("{}={}", name, prefixed));
                        continue;
                    }
                }
                ("samesite", Some(v)) if v.eq_ignore_ascii_case("none") => same_site_none = true,
                ("secure", _) => secure = true,
                _ => {}
            }
            if !part.is_empty() {
                parts.push(part.to_string());
            }
        }
        if same_site_none && !secure {
            changed = true;
            parts.push("Secure".to_string());
        }

        if changed {
            Cow::Owned(parts.join("; "))
        } else {
            Cow::Borrowed(cookie)
        }
    }

    fn rewrite_srcset(&self, srcset: &str) -> Option<String> {
        let mut changed = false;
        let candidates: Vec<String> = srcset_candidates(srcset)
            .into_iter()
            .map(|(url, descriptor)| {
                let url = match self.prefix_path(url) {
                    Some(prefixed) => {
                        changed = true;
                        prefixed
                    }
                    None => url.to_string(),
                };
                match descriptor {
                    Some(descriptor) => format!("{} {}", url, descriptor),
                    None => url,
                }
            })
            .collect();
        if changed {
            Some(candidates.join(", "))
        } else {
            None
        }
    }

    fn rewrite_attribute(&self, caps: &Captures) -> Vec<u8> {
        let lead = &caps[1];
        let (quote, raw) = match (caps.get(2), caps.get(3), caps.get(4)) {
            (Some(value), _, _) => (Some(b'"'), value.as_bytes()),
            (None, Some(value), _) => (Some(b'\''), value.as_bytes()),
            (None, None, Some(value)) => (None, value.as_bytes()),
            (None, None, None) => return caps[0].to_vec(),
        };
        let is_srcset = String::from_utf8_lossy(lead).to_ascii_lowercase().contains("srcset");
        let rewritten = std::str::from_utf8(raw).ok().and_then(|value| {
            if is_srcset {
                self.rewrite_srcset(value)
            } else {
                self.prefix_path(value)
            }
        });
        match rewritten {
            Some(value) => {
                let mut out = Vec::with_capacity(lead.len() + value.len() + 2);
                out.extend_from_slice(lead);
                out.extend(quote);
                out.extend_from_slice(value.as_bytes());
                out.extend(quote);
                out
            }
            None => caps[0].to_vec(),
        }
    }

    /// Replaces any `<base>` with one pointing at the mount and prefixes
    /// root-relative URL attributes. Bytes outside rewritten values are kept.
    pub fn rewrite_html(&self, html: &[u8]) -> Vec<u8> {
        let without_base = self.base_tag.replace_all(html, &b""[..]);
        let rewritten = self
            .attribute
            .replace_all(&without_base, |caps: &Captures| self.rewrite_attribute(caps));

        let base = format!("<base href=\"{}/\">", self.prefix);
        let mut out = Vec::with_capacity(rewritten.len() + base.len());
        match self.head_tag.find(&rewritten) {
            Some(head) => {
                out.extend_from_slice(&rewritten[..head.end()]);
                out.extend_from_slice(base.as_bytes());
                out.extend_from_slice(&rewritten[head.end()..]);
            }
            None => {
                out.extend_from_slice(base.as_bytes());
                out.extend_from_slice(&rewritten);
            }
        }
        out
    }
}

/// Splits a `srcset` into `(url, descriptor)` candidates. A URL runs up to
/// the next whitespace, so commas inside it (data URIs) are kept; trailing
/// commas end a candidate that has no descriptor.
fn srcset_candidates(srcset: &str) -> Vec<(&str, Option<&str>)> {
    let mut candidates = Vec::new();
    let mut rest = srcset;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            return candidates;
        }
        let url_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (url, after) = rest.split_at(url_end);
        if url.ends_with(',') {
            candidates.push((url.trim_end_matches(','), None));
            rest = after;
            continue;
        }
        let (descriptor, after) = match after.find(',') {
            Some(comma) => (&after[..comma], &after[comma + 1..]),
            None => (after, ""),
        };
        let descriptor = descriptor.trim();
        candidates.push((url, if descriptor.is_empty() { None } else { Some(descriptor) }));
        rest = after;
    }
}

/// Content encodings the relay can undo before rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Identity,
    Gzip,
    Deflate,
    Unsupported,
}

impl BodyEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            None => BodyEncoding::Identity,
            Some(v) if v.is_empty() || v == "identity" => BodyEncoding::Identity,
            Some(v) if v.contains("gzip") => BodyEncoding::Gzip,
            Some(v) if v == "deflate" => BodyEncoding::Deflate,
            Some(_) => BodyEncoding::Unsupported,
        }
    }
}

pub fn decompress(bytes: &[u8], encoding: BodyEncoding) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        BodyEncoding::Identity => out.extend_from_slice(bytes),
        BodyEncoding::Gzip => {
            GzDecoder::new(bytes).read_to_end(&mut out)?;
        }
        BodyEncoding::Deflate => {
            ZlibDecoder::new(bytes).read_to_end(&mut out)?;
        }
        BodyEncoding::Unsupported => {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported content encoding"));
        }
    }
    Ok(out)
}
