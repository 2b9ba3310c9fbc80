// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! A generic URI parsed into components.
//!
//! Only designed to handle "file:", "http(s):", and other schemes using
//! equivalent syntax. The userinfo field is not supported; empty hosts and
//! fragments are not distinguished from missing ones.

/// If the input is `x:/y/foo%2Fbar`, `path_segments` will be
/// `["y", "foo/bar"]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub fragment: String,
    pub rootless: bool,
    pub path_segments: Vec<String>,
    pub query_params: Vec<String>,
    /// Whether `encode` percent-escapes `/` inside segments. Turned off
    /// when rendering head names, which may legitimately contain slashes.
    pub escape_slashes_in_segments: bool,
}

impl Default for Uri {
    fn default() -> Uri {
        Uri {
            scheme: String::new(),
            host: String::new(),
            port: 0,
            fragment: String::new(),
            rootless: false,
            path_segments: Vec::new(),
            query_params: Vec::new(),
            escape_slashes_in_segments: true,
        }
    }
}

impl Uri {
    /// Parse a URI. Returns `None` for syntax errors, percent-escapes that
    /// do not decode to UTF-8, and (unless allowed) dot segments.
    pub fn parse(text: &str, allow_dot_segments: bool) -> Option<Uri> {
        let mut uri = Uri::default();
        let mut rest = text;

        if let Some(colon) = rest.find(':') {
            let candidate = &rest[..colon];
            if !candidate.is_empty()
                && candidate.starts_with(|c: char| c.is_ascii_alphabetic())
                && candidate
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            {
                uri.scheme = candidate.to_ascii_lowercase();
                rest = &rest[colon + 1..];
            }
        }

        if let Some(fragment_start) = rest.find('#') {
            uri.fragment = percent_decode(&rest[fragment_start + 1..])?;
            rest = &rest[..fragment_start];
        }

        let query = match rest.find('?') {
            Some(query_start) => {
                let q = &rest[query_start + 1..];
                rest = &rest[..query_start];
                Some(q)
            }
            None => None,
        };
        if let Some(query) = query {
            for param in query.split('&').filter(|p| !p.is_empty()) {
                uri.query_params.push(percent_decode(param)?);
            }
        }

        if let Some(authority) = rest.strip_prefix("//") {
            let (authority, path) = match authority.find('/') {
                Some(i) => (&authority[..i], &authority[i..]),
                None => (authority, ""),
            };
            if authority.contains('@') {
                return None; // userinfo not supported
            }
            match authority.rsplit_once(':') {
                Some((host, port)) => {
                    uri.host = percent_decode(host)?;
                    uri.port = port.parse().ok()?;
                }
                None => uri.host = percent_decode(authority)?,
            }
            rest = path;
        }

        if !rest.is_empty() {
            uri.rootless = !rest.starts_with('/');
            let path = rest.strip_prefix('/').unwrap_or(rest);
            for segment in path.split('/') {
                let decoded = percent_decode(segment)?;
                if !allow_dot_segments && (decoded == "." || decoded == "..") {
                    return None;
                }
                uri.path_segments.push(decoded);
            }
        }

        Some(uri)
    }

    /// `path_segments[first_index..]` joined by "/". With `first_index == 0`
    /// and a rooted path, there is an extra "/" in front.
    pub fn path_string(&self, first_index: usize) -> String {
        let joined = self.path_segments[first_index.min(self.path_segments.len())..].join("/");
        if first_index == 0 && !self.rootless {
            format!("/{joined}")
        } else {
            joined
        }
    }

    /// Encode the URI in normal form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if !self.scheme.is_empty() {
            out.push_str(&self.scheme);
            out.push(':');
        }
        if !self.host.is_empty() {
            out.push_str("//");
            out.push_str(&percent_encode(&self.host, true));
            if self.port != 0 {
                out.push(':');
                out.push_str(&self.port.to_string());
            }
        }
        for (i, segment) in self.path_segments.iter().enumerate() {
            if i > 0 || !self.rootless {
                out.push('/');
            }
            out.push_str(&percent_encode(segment, self.escape_slashes_in_segments));
        }
        if !self.query_params.is_empty() {
            out.push('?');
            for (i, param) in self.query_params.iter().enumerate() {
                if i > 0 {
                    out.push('&');
                }
                out.push_str(&percent_encode(param, true));
            }
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&percent_encode(&self.fragment, true));
        }
        out
    }
}

fn percent_decode(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
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
    // Decoding yields raw bytes; they are UTF-8 validated here because every
    // consumer of these components expects text.
    String::from_utf8(out).ok()
}

fn percent_encode(text: &str, escape_slashes: bool) -> String {
    let mut out = String::new();
    for &byte in text.as_bytes() {
        let literal = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'.' | b'_' | b'~' | b',' | b':' | b'=')
            || (byte == b'/' && !escape_slashes);
        if literal {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
