//! Request normalization.
//!
//! Converts what the HTTP layer saw into the externally visible request the
//! IdP addressed. Destination and Recipient checks compare against
//! [`RequestDescriptor::self_url`], so behind a TLS-terminating proxy the
//! forwarded headers must be honored or every response would be rejected.

use std::collections::HashMap;

/// Inbound request as observed by the transport.
#[derive(Debug, Clone, Default)]
pub struct TransportRequest {
    /// `http` or `https` as seen by the listener.
    pub scheme: String,
    /// Server name the listener is bound to, used when no Host header exists.
    pub server_name: String,
    pub server_port: u16,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    /// Header name (lowercase) -> values.
    pub headers: HashMap<String, Vec<String>>,
    /// Raw `application/x-www-form-urlencoded` body.
    pub body: Option<String>,
}

impl TransportRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// Canonical view of the request used by the protocol engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub https: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Decoded query pairs in order.
    pub query: Vec<(String, String)>,
    /// Query pairs exactly as received, for redirect signature checks.
    pub raw_query: Vec<(String, String)>,
    /// Decoded form pairs in order.
    pub form: Vec<(String, String)>,
}

impl RequestDescriptor {
    pub fn scheme(&self) -> &'static str {
        if self.https {
            "https"
        } else {
            "http"
        }
    }

    /// `scheme://host[:port]path`, default ports elided.
    pub fn self_url(&self) -> String {
        let default_port = if self.https { 443 } else { 80 };
        if self.port == default_port {
            format!("{}://{}{}", self.scheme(), self.host, self.path)
        } else {
            format!("{}://{}:{}{}", self.scheme(), self.host, self.port, self.path)
        }
    }

    /// Origin (`scheme://host[:port]`) used for same-origin checks.
    pub fn origin(&self) -> String {
        let url = self.self_url();
        url.strip_suffix(&self.path).map(str::to_string).unwrap_or(url)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        lookup(&self.query, name)
    }

    pub fn form_param(&self, name: &str) -> Option<&str> {
        lookup(&self.form, name)
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Build the descriptor. Never fails; missing headers fall back to what the
/// transport observed.
pub fn normalize(request: &TransportRequest, trust_proxy: bool) -> RequestDescriptor {
    let forwarded = |name: &str| -> Option<String> {
        if !trust_proxy {
            return None;
        }
        request
            .header(name)
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let scheme = forwarded("x-forwarded-proto")
        .unwrap_or_else(|| request.scheme.clone())
        .to_ascii_lowercase();
    let https = scheme == "https";

    let host_header = forwarded("x-forwarded-host")
        .or_else(|| request.header("host").map(str::to_string))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| request.server_name.clone());
    let (host, explicit_port) = split_host_port(&host_header);

    let port = if https {
        443
    } else {
        explicit_port.unwrap_or(request.server_port)
    };

    let path = if request.path.is_empty() {
        "/".to_string()
    } else {
        request.path.clone()
    };

    let query = request.query.as_deref().unwrap_or("");
    RequestDescriptor {
        https,
        host,
        port,
        path,
        query: parse_urlencoded(query),
        raw_query: split_pairs(query),
        form: parse_urlencoded(request.body.as_deref().unwrap_or("")),
    }
}

fn split_host_port(host: &str) -> (String, Option<u16>) {
    // IPv6 literal: [::1]:8080
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (format!("[{addr}]"), port);
        }
    }
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse() {
            Ok(port) => (name.to_string(), Some(port)),
            Err(_) => (host.to_string(), None),
        },
        None => (host.to_string(), None),
    }
}

fn split_pairs(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// `application/x-www-form-urlencoded` decoding (`+` is a space).
pub fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    split_pairs(input)
        .into_iter()
        .map(|(k, v)| (form_decode(&k), form_decode(&v)))
        .collect()
}

fn form_decode(value: &str) -> String {
    let spaced = value.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
