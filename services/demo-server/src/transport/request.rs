use std::{
    collections::HashMap,
    fmt::Write as _,
    io::{BufRead, Read},
};

use super::{ChunkedReader, HttpRequest, MAX_HEADER_BYTES, MAX_HTTP_BODY_BYTES};

const MAX_HEADER_LINES: usize = 100;

/// Reads one request from a persistent connection. `Ok(None)` means the peer
/// closed the connection cleanly before sending anything.
pub(crate) fn read_http_request<R: BufRead>(reader: &mut R) -> Result<Option<HttpRequest>, String> {
    let mut header_budget = MAX_HEADER_BYTES as u64;

    let request_line = loop {
        let Some(line) = read_bounded_line(reader, &mut header_budget)? else {
            return Ok(None);
        };
        // Stray CRLFs between pipelined requests are tolerated.
        if !line.trim().is_empty() {
            break line;
        }
    };
    let (method, target, version) = parse_request_line(&request_line)?;

    let mut headers = HashMap::new();
    let mut header_lines = 0usize;
    loop {
        let line = read_bounded_line(reader, &mut header_budget)?
            .ok_or_else(|| "connection closed inside the header block".to_string())?;
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
        header_lines += 1;
        if header_lines > MAX_HEADER_LINES {
            return Err("too many HTTP headers".to_string());
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| "invalid HTTP header".to_string())?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
    let body = if chunked {
        let mut body = Vec::new();
        ChunkedReader::new(&mut *reader)
            .take(MAX_HTTP_BODY_BYTES as u64 + 1)
            .read_to_end(&mut body)
            .map_err(|e| format!("invalid chunked body: {e}"))?;
        if body.len() > MAX_HTTP_BODY_BYTES {
            return Err(format!(
                "request body exceeds max body size ({MAX_HTTP_BODY_BYTES} bytes)"
            ));
        }
        body
    } else {
        let content_length = match headers.get("content-length") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| "invalid content-length header".to_string())?,
            None => 0,
        };
        if content_length > MAX_HTTP_BODY_BYTES {
            return Err(format!(
                "content-length exceeds max body size ({MAX_HTTP_BODY_BYTES} bytes)"
            ));
        }
        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            reader.read_exact(&mut body).map_err(|e| e.to_string())?;
        }
        body
    };

    Ok(Some(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    }))
}

fn read_bounded_line<R: BufRead>(reader: &mut R, budget: &mut u64) -> Result<Option<String>, String> {
    let mut line = String::new();
    let read = (&mut *reader)
        .take(*budget)
        .read_line(&mut line)
        .map_err(|e| e.to_string())?;
    if read == 0 {
        if *budget == 0 {
            return Err("HTTP header block too large".to_string());
        }
        return Ok(None);
    }
    *budget -= read as u64;
    if !line.ends_with('\n') {
        if *budget == 0 {
            return Err("HTTP header block too large".to_string());
        }
        return Err("connection closed mid-line".to_string());
    }
    Ok(Some(line))
}

pub(crate) fn parse_request_line(line: &str) -> Result<(String, String, String), String> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "missing HTTP method".to_string())?;
    let target = parts
        .next()
        .ok_or_else(|| "missing HTTP target".to_string())?;
    let version = parts
        .next()
        .ok_or_else(|| "missing HTTP version".to_string())?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err("unsupported HTTP version".to_string());
    }
    if !target.starts_with('/') {
        return Err("request target must be an absolute path".to_string());
    }
    Ok((method.to_string(), target.to_string(), version.to_string()))
}

/// Splits a request target into its raw path and raw query, neither decoded.
pub(crate) fn split_raw_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}

/// Decoded path plus query parameters. The first occurrence of a repeated
/// key wins.
pub(crate) fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query_str) = split_raw_target(target);
    let mut query = HashMap::new();
    if let Some(query_str) = query_str {
        for pair in query_str.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            query
                .entry(decode_query_component(k))
                .or_insert_with(|| decode_query_component(v));
        }
    }
    (percent_decode(path), query)
}

fn decode_query_component(raw: &str) -> String {
    percent_decode(&raw.replace('+', " "))
}

/// Escapes a decoded path for use in an origin-form request target. `/` and
/// the sub-delimiters allowed in path segments pass through.
pub(crate) fn percent_encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'.'
            | b'_'
            | b'~'
            | b'/'
            | b'$'
            | b'&'
            | b'+'
            | b','
            | b':'
            | b';'
            | b'='
            | b'@' => out.push(byte as char),
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

/// Decodes `%XX` escapes; malformed escapes are kept as written.
pub(crate) fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && let (Some(high), Some(low)) = (
                bytes.get(index + 1).and_then(|b| hex_value(*b)),
                bytes.get(index + 2).and_then(|b| hex_value(*b)),
            )
        {
            out.push(high << 4 | low);
            index += 3;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
