use std::{collections::HashMap, io, thread};

use latency::{LatencySpec, format_duration};
use lifecycle::ShutdownState;
use tracing::{debug, warn};

use super::{
    ConnectionCloseWriter, DemoRuntime, HttpRequest, HttpResponse, ResponseWriter, http::http_date,
    proxy, request::split_target,
};
use crate::config::ProxyService;

/// Routes one request. `/ready` is answered directly; every other route goes
/// through the `Connection: close` decorator when graceful shutdown is on.
pub(crate) fn handle_request(
    runtime: &DemoRuntime,
    request: &HttpRequest,
    writer: &mut dyn ResponseWriter,
) -> io::Result<()> {
    let (path, query) = split_target(&request.target);
    if path == "/ready" {
        return ready(runtime.shutdown_state(), writer);
    }

    if runtime.graceful_shutdown() {
        let mut decorated = ConnectionCloseWriter::new(writer, runtime.shutdown_state());
        route(runtime, request, &path, &query, &mut decorated)
    } else {
        route(runtime, request, &path, &query, writer)
    }
}

fn route(
    runtime: &DemoRuntime,
    request: &HttpRequest,
    path: &str,
    query: &HashMap<String, String>,
    writer: &mut dyn ResponseWriter,
) -> io::Result<()> {
    match path {
        "/sleep" => sleep(request, query, writer),
        "/status" => status(query, writer),
        _ => match proxy_service_for(runtime, path) {
            Some(service) => proxy::relay(runtime, service, request, path, writer),
            None => HttpResponse::not_found("404 page not found").write_to(writer),
        },
    }
}

fn ready(state: &ShutdownState, writer: &mut dyn ResponseWriter) -> io::Result<()> {
    if state.is_running() {
        return HttpResponse::ok_plain("OK".to_string()).write_to(writer);
    }
    let headers = writer.headers_mut();
    headers.set("Connection", "close");
    headers.set("Content-Length", "0");
    writer.write_header(503)
}

fn sleep(
    request: &HttpRequest,
    query: &HashMap<String, String>,
    writer: &mut dyn ResponseWriter,
) -> io::Result<()> {
    writer.headers_mut().set("Last-Modified", http_date());
    if request.method != "GET" && request.method != "POST" {
        writer.headers_mut().set("Allow", "GET, POST");
        return HttpResponse::method_not_allowed("Method not allowed").write_to(writer);
    }

    let spec = match LatencySpec::from_params(
        query.get("min").map(String::as_str),
        query.get("max").map(String::as_str),
        query.get("pdf").map(String::as_str),
    ) {
        Ok(spec) => spec,
        Err(err) => {
            warn!(%err, target = %request.target, "rejecting sleep parameters");
            return HttpResponse::bad_request(&err.to_string()).write_to(writer);
        }
    };

    let delay = spec.sample(&mut rand::thread_rng());
    debug!(delay = %format_duration(delay), "sleeping");
    thread::sleep(delay);
    HttpResponse::ok_plain(format!("Slept for {}\n", format_duration(delay))).write_to(writer)
}

fn status(query: &HashMap<String, String>, writer: &mut dyn ResponseWriter) -> io::Result<()> {
    let Some(raw) = query.get("code").filter(|raw| !raw.is_empty()) else {
        return HttpResponse::bad_request("Missing code parameter").write_to(writer);
    };
    let Some(code) = raw
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|code| (100..=599).contains(code))
    else {
        return HttpResponse::bad_request("Invalid code parameter").write_to(writer);
    };
    HttpResponse::with_status(code, format!("Returned status code {code}\n")).write_to(writer)
}

fn proxy_service_for<'a>(runtime: &'a DemoRuntime, path: &str) -> Option<&'a ProxyService> {
    let segment = path.strip_prefix('/')?.split('/').next()?;
    if segment.is_empty() {
        return None;
    }
    runtime.proxy_service(segment)
}
