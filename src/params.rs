use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::codec::Point;

/// Header/query keys the relay derives onto every request, recognized
/// across all three source formats (IQL, ILP, Prometheus remote-write).
const VERBATIM_HEADER_KEYS: &[&str] = &["authorization", "referer", "user-agent"];

/// Canonicalized view over an inbound write/query request: the header and
/// query fields the rule engine is allowed to inspect/rewrite, plus the
/// decoded point batch (empty for queries).
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub header: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub points: Vec<Point>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies only the fields this struct recognizes, mirroring the Go
    /// original's `Clone` which copies field-by-field rather than doing a
    /// deep struct copy (so extraneous map entries never leak across reuse).
    pub fn clone_selected(&self) -> Params {
        Params {
            header: self.header.clone(),
            query: self.query.clone(),
            points: self.points.clone(),
        }
    }

    pub fn set_db(&mut self, db: &str) {
        self.query.insert("db".to_string(), db.to_string());
    }

    pub fn db(&self) -> Option<&str> {
        self.query.get("db").map(String::as_str)
    }

    /// URL-encodes the query map with keys sorted lexicographically so two
    /// `Params` with the same content always produce the same string —
    /// used as the retry buffer's dedup/ordering key.
    pub fn query_encode(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Rebuilds `path`'s outgoing query string from `self.query`, implementing
    /// the re-map semantics a rule-mutated `Params` needs when dispatched as
    /// a rewritten HTTP request: the path is kept, the query is regenerated
    /// from scratch so renamed/dropped/added params actually take effect.
    pub fn remap_request(&self, path: &str) -> String {
        if self.query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, self.query_encode())
        }
    }

    /// Derives the header/query fields the rule engine is allowed to
    /// inspect: `authorization`/`referer`/`user-agent` copied verbatim,
    /// `fwd-address`/`remote-address` from `X-Forwarded-For` (falling back to
    /// the peer socket address), and `username` from HTTP Basic auth or the
    /// `u` query param.
    pub fn extract_context_fields(
        req_headers: &http::HeaderMap,
        query: &BTreeMap<String, String>,
        peer: SocketAddr,
    ) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for key in VERBATIM_HEADER_KEYS {
            if let Some(value) = req_headers.get(*key) {
                if let Ok(s) = value.to_str() {
                    out.insert(key.to_string(), s.to_string());
                }
            }
        }

        let forwarded_for = req_headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        if let Some(chain) = forwarded_for {
            out.insert("fwd-address".to_string(), chain.to_string());
            let first_hop = chain.split(',').next().unwrap_or(chain).trim();
            out.insert("remote-address".to_string(), first_hop.to_string());
        } else {
            out.insert("remote-address".to_string(), peer.ip().to_string());
        }

        let username = req_headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(basic_auth_username)
            .or_else(|| query.get("u").cloned())
            .unwrap_or_else(|| "-".to_string());
        out.insert("username".to_string(), username);

        out
    }
}

/// Extracts the username from an `Authorization: Basic <base64>` header
/// value. Returns `None` for any other scheme, malformed base64, or a
/// decoded payload with no `:` separator.
fn basic_auth_username(header_value: &str) -> Option<String> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64_decode(encoded.trim())?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, _pass) = decoded.split_once(':')?;
    Some(user.to_string())
}

const BASE64_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Hand-rolled RFC 4648 base64 decoder (standard alphabet, `=` padding).
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let input = input.trim_end_matches('=');
    let mut out = Vec::with_capacity(input.len() * 3 / 4 + 3);
    let mut buf = 0u32;
    let mut bits = 0u32;
    for c in input.bytes() {
        let val = BASE64_ALPHABET.iter().position(|&b| b == c)? as u32;
        buf = (buf << 6) | val;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((buf >> bits) as u8);
        }
    }
    Some(out)
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
