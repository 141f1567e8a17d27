//! Canonical endpoint descriptor threaded through every layer.
//!
//! A [`Url`] is both a routing key and a configuration carrier: the
//! addressing fields say *where* an endpoint lives, the parameter map says
//! *how* the framework should behave when talking to it. URLs are immutable;
//! every mutator returns a new value. Parameters live in a `BTreeMap` so the
//! canonical string form is stable and equality is insensitive to insertion
//! order.
//!
//! Parameter values are percent-encoded in the canonical form, which lets a
//! whole URL nest inside another one (the `export` / `refer` parameters used
//! by the registry protocol).

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::constants::DYNAMIC_KEY;
use crate::constants::ENABLED_KEY;
use crate::constants::GROUP_KEY;
use crate::constants::INTERFACE_KEY;
use crate::constants::VERSION_KEY;

/// Errors produced while parsing a canonical URL string.
#[derive(Debug, Snafu)]
pub enum UrlError {
    /// The input has no `://` separator.
    #[snafu(display("URL {input:?} has no protocol separator"))]
    MissingProtocol { input: String },

    /// The protocol part before `://` is empty.
    #[snafu(display("URL {input:?} has an empty protocol"))]
    EmptyProtocol { input: String },

    /// The port part of the authority is not a valid u16.
    #[snafu(display("URL {input:?} has an invalid port {port:?}"))]
    InvalidPort { input: String, port: String },

    /// A percent escape is truncated or not valid UTF-8 after decoding.
    #[snafu(display("invalid percent escape in {input:?}"))]
    InvalidEscape { input: String },
}

/// Immutable endpoint descriptor: `(protocol, host, port, path, parameters)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Url {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl Url {
    /// Construct from components. Parameter values are taken verbatim
    /// (decoded form); encoding happens when the URL is rendered.
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: path.into(),
            parameters,
        }
    }

    /// Parse the canonical form produced by [`fmt::Display`].
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let (protocol, rest) = input.split_once("://").ok_or_else(|| {
            MissingProtocolSnafu { input: input.to_string() }.build()
        })?;
        if protocol.is_empty() {
            return EmptyProtocolSnafu { input: input.to_string() }.fail();
        }

        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = match base.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (base, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    InvalidPortSnafu { input: input.to_string(), port: port.to_string() }.build()
                })?;
                (host, port)
            }
            None => (authority, 0),
        };

        let mut parameters = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                parameters.insert(
                    percent_decode(key).ok_or_else(|| {
                        InvalidEscapeSnafu { input: input.to_string() }.build()
                    })?,
                    percent_decode(value).ok_or_else(|| {
                        InvalidEscapeSnafu { input: input.to_string() }.build()
                    })?,
                );
            }
        }

        Ok(Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
            parameters,
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port` pair.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Read a parameter; `None` when absent.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Read a parameter, falling back to `default` when absent or empty.
    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.param(key) {
            Some(v) if !v.is_empty() => v,
            _ => default,
        }
    }

    /// Read a `true`/`false` parameter with a default.
    pub fn bool_param(&self, key: &str, default: bool) -> bool {
        self.param(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Read a numeric parameter with a default.
    pub fn u64_param(&self, key: &str, default: u64) -> u64 {
        self.param(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Parse a parameter value as a nested URL.
    pub fn url_param(&self, key: &str) -> Option<Result<Url, UrlError>> {
        self.param(key).map(Url::parse)
    }

    /// Parse a bare `k=v&k2=v2` query string (the `refer` parameter's
    /// payload) into a parameter map.
    pub fn parse_query(query: &str) -> Result<BTreeMap<String, String>, UrlError> {
        let mut parameters = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            parameters.insert(
                percent_decode(key)
                    .ok_or_else(|| InvalidEscapeSnafu { input: query.to_string() }.build())?,
                percent_decode(value)
                    .ok_or_else(|| InvalidEscapeSnafu { input: query.to_string() }.build())?,
            );
        }
        Ok(parameters)
    }

    /// Return a new URL with `key` set to `value`.
    pub fn with_param(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut url = self.clone();
        url.parameters.insert(key.into(), value.into());
        url
    }

    /// Return a new URL with every `(key, value)` pair applied.
    pub fn with_params<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut url = self.clone();
        for (key, value) in pairs {
            url.parameters.insert(key.into(), value.into());
        }
        url
    }

    /// Return a new URL without `key`.
    pub fn without_param(&self, key: &str) -> Self {
        let mut url = self.clone();
        url.parameters.remove(key);
        url
    }

    /// Return a new URL without any of `keys`.
    pub fn without_params(&self, keys: &[&str]) -> Self {
        let mut url = self.clone();
        for key in keys {
            url.parameters.remove(*key);
        }
        url
    }

    /// Return a new URL keeping only `keys` (plus nothing else).
    pub fn retaining_params(&self, keys: &[&str]) -> Self {
        let mut url = self.clone();
        url.parameters.retain(|k, _| keys.contains(&k.as_str()));
        url
    }

    pub fn with_protocol(&self, protocol: impl Into<String>) -> Self {
        let mut url = self.clone();
        url.protocol = protocol.into();
        url
    }

    pub fn with_host(&self, host: impl Into<String>) -> Self {
        let mut url = self.clone();
        url.host = host.into();
        url
    }

    pub fn with_port(&self, port: u16) -> Self {
        let mut url = self.clone();
        url.port = port;
        url
    }

    pub fn with_path(&self, path: impl Into<String>) -> Self {
        let mut url = self.clone();
        url.path = path.into();
        url
    }

    /// The service interface this URL addresses: the `interface` parameter
    /// when present, otherwise the path.
    pub fn service_interface(&self) -> &str {
        match self.param(INTERFACE_KEY) {
            Some(i) if !i.is_empty() => i,
            _ => &self.path,
        }
    }

    /// `[group/]interface[:version]` — the key a service is registered and
    /// discovered under.
    pub fn service_key(&self) -> String {
        let mut key = String::new();
        if let Some(group) = self.param(GROUP_KEY).filter(|g| !g.is_empty()) {
            key.push_str(group);
            key.push('/');
        }
        key.push_str(self.service_interface());
        if let Some(version) = self.param(VERSION_KEY).filter(|v| !v.is_empty()) {
            key.push(':');
            key.push_str(version);
        }
        key
    }

    /// The canonical string with `dynamic` and `enabled` removed; identifies
    /// a local export slot in the registry protocol.
    pub fn cache_key(&self) -> String {
        self.without_params(&[DYNAMIC_KEY, ENABLED_KEY]).to_string()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        let mut sep = '?';
        for (key, value) in &self.parameters {
            write!(f, "{}{}={}", sep, percent_encode(key), percent_encode(value))?;
            sep = '&';
        }
        Ok(())
    }
}

/// Escape every byte outside the RFC 3986 unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Reverse of [`percent_encode`]; `None` on truncated escapes or invalid
/// UTF-8.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
