use std::sync::Arc;

use demo_server::{
    config::ServerConfig,
    transport::{DemoRuntime, SharedRuntime, handle_http_request_bytes},
};
use lifecycle::ShutdownState;

fn sample_runtime(graceful: bool) -> SharedRuntime {
    let config = ServerConfig::from_lookup(|key| match key {
        "DEMO_GRACEFUL_SHUTDOWN" if graceful => Some("true".to_string()),
        _ => None,
    })
    .expect("empty environment should yield defaults");
    DemoRuntime::shared(&config, Arc::new(ShutdownState::new()))
}

#[test]
fn transport_ready_reports_readiness_until_draining() {
    let runtime = sample_runtime(true);
    let request = b"GET /ready HTTP/1.1\r\nHost: localhost\r\n\r\n";

    let response = handle_http_request_bytes(&runtime, request)
        .expect("request should parse and return response");
    let response = String::from_utf8(response).expect("response should be UTF-8");
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("\r\n\r\nOK"));

    runtime.shutdown_state().begin_draining();
    let response = handle_http_request_bytes(&runtime, request)
        .expect("request should parse and return response");
    let response = String::from_utf8(response).expect("response should be UTF-8");
    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable"));
    assert!(response.contains("Connection: close\r\n"));
}

#[test]
fn transport_status_endpoint_returns_requested_code() {
    let runtime = sample_runtime(true);
    let request = b"GET /status?code=503 HTTP/1.1\r\nHost: localhost\r\n\r\n";

    let response = handle_http_request_bytes(&runtime, request)
        .expect("request should parse and return response");
    let response = String::from_utf8(response).expect("response should be UTF-8");

    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable"));
    assert!(response.contains("Content-Type: text/plain; charset=utf-8\r\n"));
    assert!(response.ends_with("Returned status code 503\n"));
}

#[test]
fn transport_sleep_endpoint_honours_zero_bounds() {
    let runtime = sample_runtime(false);
    let request = b"POST /sleep?min=0s&max=0s HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n";

    let response = handle_http_request_bytes(&runtime, request)
        .expect("request should parse and return response");
    let response = String::from_utf8(response).expect("response should be UTF-8");

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("Slept for 0s\n"));
}

#[test]
fn transport_rejects_malformed_request_lines() {
    let runtime = sample_runtime(true);

    let err = handle_http_request_bytes(&runtime, b"GET /ready HTTP/3\r\n\r\n")
        .expect_err("unsupported version should fail to parse");
    assert_eq!(err, "unsupported HTTP version");

    let err = handle_http_request_bytes(&runtime, b"")
        .expect_err("empty input carries no request");
    assert_eq!(err, "missing request line");
}

#[test]
fn transport_draining_decorates_unknown_routes_once() {
    let runtime = sample_runtime(true);
    runtime.shutdown_state().begin_draining();
    let request = b"GET /nowhere HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";

    let response = handle_http_request_bytes(&runtime, request)
        .expect("request should parse and return response");
    let response = String::from_utf8(response).expect("response should be UTF-8");

    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    assert_eq!(response.matches("Connection: close").count(), 1);
}
