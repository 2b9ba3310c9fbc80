// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The MemoDB JSON projection.
//!
//! JSON cannot represent every node kind directly, so non-native kinds are
//! wrapped in single-key objects: `{"float": "..."}` (an RFC 8785 number
//! string, or `NaN` / `Infinity` / `-Infinity`), `{"base64": "..."}` for
//! byte strings, `{"cid": "..."}` for links, and `{"map": {...}}` for maps.
//! Any other bare JSON object is rejected on input.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::cid;
use crate::error::{Error, Result};
use crate::node::{Map, Node};

/// Render a node as compact MemoDB JSON.
pub fn encode(node: &Node) -> String {
    let mut out = String::new();
    write_node(&mut out, node);
    out
}

/// Parse MemoDB JSON into a node.
pub fn decode(input: &str) -> Result<Node> {
    let value: serde_json::Value =
        serde_json::from_str(input).map_err(|e| Error::MalformedJson(e.to_string()))?;
    from_json(&value)
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Null => out.push_str("null"),
        Node::Bool(true) => out.push_str("true"),
        Node::Bool(false) => out.push_str("false"),
        Node::Integer(value) => out.push_str(&value.to_string()),
        Node::Float(value) => {
            out.push_str("{\"float\":\"");
            out.push_str(&format_float(*value));
            out.push_str("\"}");
        }
        Node::Bytes(bytes) => {
            out.push_str("{\"base64\":\"");
            out.push_str(&BASE64.encode(bytes));
            out.push_str("\"}");
        }
        Node::String(text) => write_string(out, text),
        Node::Link(link) => {
            out.push_str("{\"cid\":\"");
            out.push_str(&cid::to_text(link));
            out.push_str("\"}");
        }
        Node::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_node(out, item);
            }
            out.push(']');
        }
        Node::Map(map) => {
            out.push_str("{\"map\":{");
            for (i, (key, value)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_node(out, value);
            }
            out.push_str("}}");
        }
    }
}

fn write_string(out: &mut String, text: &str) {
    out.push('"');
    for c in text.chars() {
        match c {
            '\x08' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\x0c' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Serialize a float the way RFC 8785 (and ECMAScript `Number::toString`)
/// does, except that -0.0 prints as "-0".
fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_owned();
    }
    let mut out = String::new();
    let magnitude = if value.is_sign_negative() {
        out.push('-');
        -value
    } else {
        value
    };
    if magnitude.is_infinite() {
        out.push_str("Infinity");
        return out;
    }
    if magnitude == 0.0 {
        out.push('0');
        return out;
    }

    // Shortest round-trip decimal via ryu, reshaped to the ECMAScript rules.
    let mut buffer = ryu::Buffer::new();
    let (digits, n) = decompose(buffer.format_finite(magnitude));
    let k = digits.len() as i32;
    if k <= n && n <= 21 {
        out.push_str(&digits);
        for _ in 0..(n - k) {
            out.push('0');
        }
    } else if 0 < n && n <= 21 {
        out.push_str(&digits[..n as usize]);
        out.push('.');
        out.push_str(&digits[n as usize..]);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        for _ in 0..-n {
            out.push('0');
        }
        out.push_str(&digits);
    } else {
        out.push_str(&digits[..1]);
        if k > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        if n - 1 >= 0 {
            out.push('+');
        }
        out.push_str(&(n - 1).to_string());
    }
    out
}

/// Split a ryu-formatted positive number into its significant digits and
/// the position `n` of the decimal point (value = 0.digits × 10^n).
fn decompose(formatted: &str) -> (String, i32) {
    let (mantissa, exponent) = match formatted.split_once(|c: char| c == 'e' || c == 'E') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (formatted, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    let mut digits: String = int_part.chars().chain(frac_part.chars()).collect();
    let mut n = int_part.len() as i32 + exponent;
    let leading = digits.chars().take_while(|&c| c == '0').count();
    digits.drain(..leading);
    n -= leading as i32;
    let trailing = digits.chars().rev().take_while(|&c| c == '0').count();
    digits.truncate(digits.len() - trailing);
    (digits, n)
}

fn from_json(value: &serde_json::Value) -> Result<Node> {
    match value {
        serde_json::Value::Null => Ok(Node::Null),
        serde_json::Value::Bool(b) => Ok(Node::Bool(*b)),
        serde_json::Value::Number(number) => {
            if let Some(i) = number.as_i64() {
                Ok(Node::Integer(i as i128))
            } else if let Some(u) = number.as_u64() {
                Ok(Node::Integer(u as i128))
            } else {
                Err(Error::MalformedJson(
                    "floats must use the {\"float\": ...} form".to_owned(),
                ))
            }
        }
        serde_json::Value::String(text) => Ok(Node::String(text.clone())),
        serde_json::Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(from_json(item)?);
            }
            Ok(Node::List(list))
        }
        serde_json::Value::Object(object) => from_special_object(object),
    }
}

fn from_special_object(object: &serde_json::Map<String, serde_json::Value>) -> Result<Node> {
    let invalid = || Error::MalformedJson("Invalid special JSON object".to_owned());
    if object.len() != 1 {
        return Err(invalid());
    }
    let (key, value) = object.iter().next().unwrap_or_else(|| unreachable!());
    match (key.as_str(), value) {
        ("float", serde_json::Value::String(text)) => parse_float(text).map(Node::Float),
        ("base64", serde_json::Value::String(text)) => BASE64
            .decode(text)
            .map(Node::Bytes)
            .map_err(|_| Error::MalformedJson("invalid base64".to_owned())),
        ("cid", serde_json::Value::String(text)) => cid::parse(text)
            .map(Node::Link)
            .map_err(|_| Error::MalformedJson("invalid CID".to_owned())),
        ("map", serde_json::Value::Object(entries)) => {
            let mut map = Map::new();
            for (k, v) in entries {
                map.insert(k.clone(), from_json(v)?);
            }
            Ok(Node::Map(map))
        }
        _ => Err(invalid()),
    }
}

fn parse_float(text: &str) -> Result<f64> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        _ => text
            .parse::<f64>()
            .map_err(|_| Error::MalformedJson("invalid float".to_owned()))
            .and_then(|f| {
                if f.is_finite() {
                    Ok(f)
                } else {
                    Err(Error::MalformedJson("invalid float".to_owned()))
                }
            }),
    }
}
