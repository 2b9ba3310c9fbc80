// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! One request for the server to respond to.
//!
//! The [`Request`] trait carries the transport-independent behavior:
//! Accept negotiation, ETag handling, cache-control policies, and RFC 7807
//! problem responses. Transports implement the small set of required
//! methods; tests drive the provided ones directly.

use memodb_ipld::{cbor, cid, json, save_as_ipld, Cid, Kind, Node};
use memodb_store::Uri;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    OctetStream,
    Json,
    Cbor,
    Html,
    ProblemJson,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    BadRequest = 400,
    NotFound = 404,
    MethodNotAllowed = 405,
    UnsupportedMediaType = 415,
    NotImplemented = 501,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheControl {
    Ephemeral,
    Mutable,
    Immutable,
}

pub trait Request {
    fn method(&self) -> Option<Method>;
    fn uri(&self) -> Option<&Uri>;
    fn header(&self, name: &str) -> Option<&str>;
    fn body(&self) -> &[u8];

    fn send_status(&mut self, status: u16);
    fn send_header(&mut self, key: &str, value: &str);
    /// Send the body and mark the request responded.
    fn send_body(&mut self, body: &[u8]);

    fn responded(&self) -> bool;

    /// Parse the Accept header and find the q-value for `content_type`,
    /// scaled from 0 to 1000.
    ///
    /// https://datatracker.ietf.org/doc/html/rfc7231#section-5.3.2
    fn accept_quality(&self, content_type: ContentType) -> u32 {
        let (wanted_type, wanted_subtype) = match content_type {
            ContentType::OctetStream => ("application", "octet-stream"),
            ContentType::Json => ("application", "json"),
            ContentType::Cbor => ("application", "cbor"),
            ContentType::Html => ("text", "html"),
            ContentType::ProblemJson => ("application", "problem+json"),
        };
        let accept = match self.header("accept") {
            Some(value) => value,
            None => {
                // No Accept header: accept anything, with a nudge toward JSON.
                return matches!(content_type, ContentType::Json | ContentType::ProblemJson)
                    as u32;
            }
        };
        parse_accept_quality(accept, wanted_type, wanted_subtype)
    }

    /// Decode the node submitted as the request body, negotiating on
    /// Content-Type. On failure an error response is sent and `None`
    /// returned. An absent body yields `default` when given.
    fn get_content_node(&mut self, default: Option<Node>) -> Option<Node> {
        let body = self.body().to_vec();
        if body.is_empty() {
            if default.is_some() {
                return default;
            }
            self.send_error(
                Status::BadRequest,
                Some("/problems/missing-body"),
                "Missing request Body",
                None,
            );
            return None;
        }

        let content_type = self
            .header("content-type")
            .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();

        match content_type.as_str() {
            "application/cbor" => match cbor::decode(&body) {
                Ok(node) => Some(node),
                Err(e) => {
                    self.send_error(
                        Status::BadRequest,
                        Some("/problems/invalid-or-unsupported-cbor"),
                        "Invalid or unsupported CBOR",
                        Some(&e.to_string()),
                    );
                    None
                }
            },
            "application/json" => {
                let text = match std::str::from_utf8(&body) {
                    Ok(text) => text,
                    Err(_) => {
                        self.send_error(
                            Status::BadRequest,
                            Some("/problems/invalid-or-unsupported-json"),
                            "Invalid or unsupported JSON",
                            Some("body is not UTF-8"),
                        );
                        return None;
                    }
                };
                match json::decode(text) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        self.send_error(
                            Status::BadRequest,
                            Some("/problems/invalid-or-unsupported-json"),
                            "Invalid or unsupported JSON",
                            Some(&e.to_string()),
                        );
                        None
                    }
                }
            }
            "application/octet-stream" => Some(Node::bytes(body)),
            _ => {
                self.send_error(Status::UnsupportedMediaType, None, "Unsupported Media Type", None);
                None
            }
        }
    }

    fn start_response(&mut self, status: u16, cache_control: CacheControl) {
        self.send_status(status);
        self.send_header("Server", "MemoDB");
        self.send_header("Vary", "Accept, Accept-Encoding");
        let value = match cache_control {
            CacheControl::Ephemeral | CacheControl::Mutable => "max-age=0, must-revalidate",
            CacheControl::Immutable => "max-age=604800, immutable",
        };
        self.send_header("Cache-Control", value);
    }

    fn has_if_none_match(&self, etag: &str) -> bool {
        let mut remainder = match self.header("if-none-match") {
            Some(value) => value,
            None => return false,
        };
        loop {
            remainder = remainder.trim_start_matches([' ', '\t']);
            if remainder.is_empty() {
                return false;
            }
            if remainder.starts_with('*') {
                return true;
            }
            remainder = remainder.strip_prefix("W/").unwrap_or(remainder);
            remainder = match remainder.strip_prefix('"') {
                Some(rest) => rest,
                None => return false, // invalid header
            };
            let (candidate, rest) = match remainder.split_once('"') {
                Some(split) => split,
                None => return false, // invalid header
            };
            if candidate == etag {
                return true;
            }
            remainder = rest.trim_start_matches([' ', '\t']);
            remainder = match remainder.strip_prefix(',') {
                Some(rest) => rest,
                None => return false,
            };
        }
    }

    fn send_content(
        &mut self,
        cache_control: CacheControl,
        etag: &str,
        content_type: &str,
        content: &[u8],
    ) {
        self.start_response(200, cache_control);
        self.send_header("Content-Type", content_type);
        self.send_header("ETag", &format!("\"{etag}\""));
        self.send_body(content);
    }

    fn send_content_node(
        &mut self,
        node: &Node,
        cid_if_known: Option<&Cid>,
        cache_control: CacheControl,
    ) {
        let octet_stream_quality = self.accept_quality(ContentType::OctetStream);
        let json_quality = self.accept_quality(ContentType::Json);
        let cbor_quality = self.accept_quality(ContentType::Cbor);
        let html_quality = self.accept_quality(ContentType::Html);

        let computed;
        let node_cid = match cid_if_known {
            Some(known) => known,
            None => {
                computed = save_as_ipld(node).0;
                &computed
            }
        };
        let cid_text = cid::to_text(node_cid);

        // When the client doesn't care, prefer json > octet-stream > cbor >
        // html. Many clients (curl, Python requests) send "Accept: */*".
        let (content_type, etag) = if node.kind() == Kind::Bytes
            && octet_stream_quality > json_quality
            && octet_stream_quality >= cbor_quality
            && octet_stream_quality >= html_quality
        {
            (ContentType::OctetStream, format!("raw+{cid_text}"))
        } else if html_quality > cbor_quality && html_quality > json_quality {
            (ContentType::Html, format!("html+{cid_text}"))
        } else if cbor_quality > json_quality {
            (ContentType::Cbor, format!("cbor+{cid_text}"))
        } else {
            (ContentType::Json, format!("json+{cid_text}"))
        };

        if self.has_if_none_match(&etag) {
            self.start_response(304, cache_control);
            self.send_header("ETag", &format!("\"{etag}\""));
            self.send_body(&[]);
            return;
        }

        match content_type {
            ContentType::OctetStream => {
                let bytes = node
                    .as_bytes()
                    .unwrap_or_else(|_| unreachable!("checked kind above"))
                    .to_vec();
                self.send_content(cache_control, &etag, "application/octet-stream", &bytes);
            }
            ContentType::Html => {
                let title = match cid_if_known {
                    Some(known) => cid::to_text(known),
                    None => "MemoDB Node".to_owned(),
                };
                let page = html_node_page(&title, &json::encode(node));
                self.send_content(cache_control, &etag, "text/html", page.as_bytes());
            }
            ContentType::Cbor => {
                let bytes = cbor::encode(node).bytes;
                self.send_content(cache_control, &etag, "application/cbor", &bytes);
            }
            _ => {
                let text = json::encode(node);
                self.send_content(cache_control, &etag, "application/json", text.as_bytes());
            }
        }
    }

    fn send_content_uris(&mut self, uris: &[Uri], cache_control: CacheControl) {
        let mut encoded: Vec<String> = uris.iter().map(Uri::encode).collect();
        encoded.sort();

        let json_quality = self.accept_quality(ContentType::Json);
        let cbor_quality = self.accept_quality(ContentType::Cbor);
        let html_quality = self.accept_quality(ContentType::Html);
        if html_quality > json_quality && html_quality > cbor_quality {
            let node = Node::list(encoded.iter().map(|u| Node::from(u.as_str())).collect::<Vec<_>>());
            let cid_text = cid::to_text(&save_as_ipld(&node).0);
            let etag = format!("html+{cid_text}");
            if self.has_if_none_match(&etag) {
                self.start_response(304, cache_control);
                self.send_header("ETag", &format!("\"{etag}\""));
                self.send_body(&[]);
                return;
            }
            let title = self.uri().map(Uri::encode).unwrap_or_default();
            let page = html_uri_page(&title, &encoded);
            self.send_content(cache_control, &etag, "text/html", page.as_bytes());
            return;
        }

        let node = Node::list(encoded.iter().map(|u| Node::from(u.as_str())).collect::<Vec<_>>());
        self.send_content_node(&node, None, cache_control);
    }

    fn send_created(&mut self, path: Option<&Uri>) {
        self.start_response(201, CacheControl::Ephemeral);
        if let Some(path) = path {
            self.send_header("Location", &path.encode());
        }
        self.send_body(&[]);
    }

    fn send_accepted(&mut self) {
        self.start_response(202, CacheControl::Ephemeral);
        self.send_body(&[]);
    }

    fn send_deleted(&mut self) {
        self.start_response(204, CacheControl::Ephemeral);
        self.send_body(&[]);
    }

    /// Send an error following RFC 7807, or as HTML when preferred.
    fn send_error(
        &mut self,
        status: Status,
        problem_type: Option<&str>,
        title: &str,
        detail: Option<&str>,
    ) {
        self.start_response(status as u16, CacheControl::Ephemeral);
        self.send_error_after_status(status, problem_type, title, detail);
    }

    fn send_method_not_allowed(&mut self, allow: &str) {
        self.start_response(405, CacheControl::Mutable);
        self.send_header("Allow", allow);
        self.send_error_after_status(Status::MethodNotAllowed, None, "Method Not Allowed", None);
    }

    fn send_error_after_status(
        &mut self,
        status: Status,
        problem_type: Option<&str>,
        title: &str,
        detail: Option<&str>,
    ) {
        let problem_quality = self.accept_quality(ContentType::ProblemJson);
        let html_quality = self.accept_quality(ContentType::Html);
        self.send_header("Content-Language", "en");

        if html_quality > problem_quality {
            self.send_header("Content-Type", "text/html");
            let body = format!(
                "<title>{title}</title><h1>Error {status}: {title}</h1><p>{detail}\n",
                title = escape_html(title),
                status = status as u16,
                detail = detail.map(escape_html).unwrap_or_default(),
            );
            self.send_body(body.as_bytes());
        } else {
            let mut body = String::from("{");
            if let Some(problem_type) = problem_type {
                body.push_str(&format!("\"type\":{},", json_string(problem_type)));
            }
            body.push_str(&format!("\"title\":{}", json_string(title)));
            body.push_str(&format!(",\"status\":{}", status as u16));
            if let Some(detail) = detail {
                body.push_str(&format!(",\"detail\":{}", json_string(detail)));
            }
            body.push('}');
            self.send_header("Content-Type", "application/problem+json");
            self.send_body(body.as_bytes());
        }
    }
}

fn json_string(text: &str) -> String {
    json::encode(&Node::from(text))
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// A minimal HTML view of a node, displayed with jQuery json-viewer.
/// Copy-and-paste of the formatted JSON still works.
fn html_node_page(title: &str, body_json: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<script src="https://unpkg.com/jquery@3.6/dist/jquery.min.js"></script>
<script src="https://unpkg.com/jquery.json-viewer@1.4/json-viewer/jquery.json-viewer.js"></script>
<link href="https://unpkg.com/jquery.json-viewer@1.4/json-viewer/jquery.json-viewer.css" type="text/css" rel="stylesheet">
<script>
  $(function() {{
    $('pre').jsonViewer(JSON.parse($('pre').text()), {{withQuotes:true}});
  }});
</script>
<title>{title}</title>
<h1>{title}</h1>
<pre>{body}</pre>
"#,
        title = escape_html(title),
        body = escape_html(body_json),
    )
}

fn html_uri_page(title: &str, uris: &[String]) -> String {
    let mut out = format!(
        "<!DOCTYPE html>\n<title>{title}</title>\n<h1>{title}</h1>\n<ul>\n",
        title = escape_html(title)
    );
    for uri in uris {
        let escaped = escape_html(uri);
        out.push_str(&format!("<li><a href=\"{escaped}\">{escaped}</a></li>\n"));
    }
    out.push_str("</ul>\n");
    out
}

fn parse_accept_quality(accept: &str, wanted_type: &str, wanted_subtype: &str) -> u32 {
    let mut any_type_q = 0u32;
    let mut any_subtype_q: Option<u32> = None;
    let mut remainder = accept;

    loop {
        remainder = remainder.trim_start_matches([' ', '\t']);
        if remainder.is_empty() {
            break;
        }
        let (media_type, rest) = match remainder.split_once('/') {
            Some(split) => split,
            None => return 0,
        };
        remainder = rest;
        let end = remainder.find([';', ',']).unwrap_or(remainder.len());
        let media_subtype = remainder[..end].trim_end_matches([' ', '\t']);
        remainder = &remainder[end..];

        let mut q = 1000u32;
        while let Some(rest) = remainder.strip_prefix(';') {
            remainder = rest.trim_start_matches([' ', '\t']);
            let end = remainder.find([';', ',', '=']).unwrap_or(remainder.len());
            let param = remainder[..end].trim_end_matches([' ', '\t']);
            remainder = &remainder[end..];
            let mut value = "";
            if let Some(rest) = remainder.strip_prefix('=') {
                remainder = rest;
                let end = if remainder.starts_with('"') {
                    match skip_quoted_string(remainder) {
                        Some(end) => end,
                        None => return 0, // missing end quote
                    }
                } else {
                    remainder.find([';', ',']).unwrap_or(remainder.len())
                };
                value = remainder[..end].trim_end_matches([' ', '\t']);
                remainder = remainder[end..].trim_start_matches([' ', '\t']);
            }
            if param.eq_ignore_ascii_case("q") {
                if let Some(parsed) = parse_quality(value) {
                    q = parsed;
                }
            }
        }

        if media_type.eq_ignore_ascii_case(wanted_type) {
            if media_subtype.eq_ignore_ascii_case(wanted_subtype) {
                return q;
            }
            if media_subtype == "*" {
                any_subtype_q = Some(q);
            }
        } else if media_type == "*" && media_subtype == "*" {
            any_type_q = q;
        }

        if remainder.is_empty() {
            break;
        }
        remainder = match remainder.strip_prefix(',') {
            Some(rest) => rest,
            None => return 0, // extra characters after value
        };
    }

    any_subtype_q.unwrap_or(any_type_q)
}

/// Byte offset just past a leading `"..."`, honoring backslash escapes.
fn skip_quoted_string(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Some(i + 1),
            b'\\' => i += 2,
            _ => i += 1,
        }
    }
    None
}

/// "q=1", "q=0.5", "q=0.05" etc., scaled to 0..=1000. Values that do not
/// start with a digit are ignored.
fn parse_quality(value: &str) -> Option<u32> {
    let mut chars = value.chars();
    let integer = match chars.next() {
        Some(c) if c.is_ascii_digit() => c as u32 - '0' as u32,
        _ => return None,
    };
    let mut q = integer * 1000;
    if chars.next() == Some('.') {
        let mut scale = 100;
        for c in chars.take(3) {
            if !c.is_ascii_digit() {
                break;
            }
            q += (c as u32 - '0' as u32) * scale;
            scale /= 10;
        }
    }
    Some(q.min(1000))
}
