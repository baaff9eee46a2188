use std::io;

use tracing::warn;

use super::{
    DemoRuntime, Headers, HttpRequest, HttpResponse, ResponseWriter, UpstreamRequest,
    request::{percent_encode_path, split_raw_target},
};
use crate::config::ProxyService;

/// Request headers copied onto the upstream request when present.
pub const TRACE_HEADERS: [&str; 10] = [
    "X-Request-ID",
    "X-B3-Traceid",
    "X-B3-Spanid",
    "X-B3-Parentspanid",
    "X-B3-Sampled",
    "X-B3-Flags",
    "X-Ot-Span-Context",
    "Traceparent",
    "Tracestate",
    "B3",
];

/// Relays `request` to `service` and streams the upstream status and body
/// back. `path` is the decoded path the service was matched on. Upstream
/// headers are not copied.
pub(crate) fn relay(
    runtime: &DemoRuntime,
    service: &ProxyService,
    request: &HttpRequest,
    path: &str,
    writer: &mut dyn ResponseWriter,
) -> io::Result<()> {
    let (_, raw_query) = split_raw_target(&request.target);
    let upstream_request = UpstreamRequest {
        method: request.method.clone(),
        authority: service.authority.clone(),
        path_and_query: upstream_target(path, raw_query, &service.name),
        headers: forward_trace_headers(request),
    };

    let mut response = match runtime.upstream().send(&upstream_request) {
        Ok(response) => response,
        Err(err) => {
            warn!(service = %service.name, %err, "request to upstream failed");
            return HttpResponse::bad_gateway(&format!("Request to {} failed", service.name))
                .write_to(writer);
        }
    };

    writer.write_header(response.status())?;
    if let Err(err) = writer.copy_from(&mut response) {
        warn!(service = %service.name, %err, "failed to copy upstream response body");
        return Err(err);
    }
    Ok(())
}

/// Drops the leading `/{service}` segment of the decoded `path` once,
/// re-encodes what is left and reattaches the raw query.
pub(crate) fn upstream_target(path: &str, raw_query: Option<&str>, service: &str) -> String {
    let rest = path
        .strip_prefix('/')
        .and_then(|path| path.strip_prefix(service))
        .unwrap_or(path);
    let mut target = percent_encode_path(rest);
    if !target.starts_with('/') {
        target.insert(0, '/');
    }
    if let Some(query) = raw_query.filter(|query| !query.is_empty()) {
        target.push('?');
        target.push_str(query);
    }
    target
}

pub(crate) fn forward_trace_headers(request: &HttpRequest) -> Headers {
    let mut headers = Headers::new();
    for name in TRACE_HEADERS {
        if let Some(value) = request.header(name).filter(|value| !value.is_empty()) {
            headers.set(name, value);
        }
    }
    headers
}
