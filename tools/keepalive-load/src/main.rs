use std::{
    io::{BufReader, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::mpsc,
    time::{Duration, Instant},
};

use demo_server::transport::{BodyFraming, ChunkedReader, read_response_head};
use latency::{format_duration, parse_duration};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Config {
    addr: String,
    path: String,
    method: String,
    concurrency: usize,
    duration: Duration,
    connect_timeout_ms: u64,
    read_timeout_ms: u64,
}

#[derive(Debug, Default)]
struct WorkerStats {
    success: usize,
    failed: usize,
    reuse_failures: usize,
    connections_opened: usize,
    close_advertised: usize,
    latencies_ms: Vec<f64>,
    sample_errors: Vec<String>,
}

impl WorkerStats {
    fn record_error(&mut self, err: String) {
        if self.sample_errors.len() < 4 {
            self.sample_errors.push(err);
        }
    }
}

struct Connection {
    reader: BufReader<TcpStream>,
    served: usize,
}

enum Exchange {
    Reply { status: u16, keep_alive: bool },
    Failed(String),
}

fn main() {
    let config = match parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config) {
        eprintln!("keepalive-load failed: {err}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), String> {
    let socket_addr = resolve(&config.addr)?;
    let started_at = Instant::now();
    let deadline = started_at + config.duration;
    let (tx, rx) = mpsc::channel::<WorkerStats>();

    std::thread::scope(|scope| {
        for _ in 0..config.concurrency {
            let tx = tx.clone();
            let config = &config;
            scope.spawn(move || {
                let _ = tx.send(run_worker(config, socket_addr, deadline));
            });
        }
    });
    drop(tx);

    let elapsed_seconds = started_at.elapsed().as_secs_f64();
    let mut totals = WorkerStats::default();
    let mut errors = Vec::new();
    for stats in rx {
        totals.success += stats.success;
        totals.failed += stats.failed;
        totals.reuse_failures += stats.reuse_failures;
        totals.connections_opened += stats.connections_opened;
        totals.close_advertised += stats.close_advertised;
        totals.latencies_ms.extend(stats.latencies_ms);
        for err in stats.sample_errors {
            if errors.len() >= 10 {
                break;
            }
            errors.push(err);
        }
    }

    let attempted = totals.success + totals.failed;
    if attempted == 0 {
        return Err("no requests completed".to_string());
    }

    totals.latencies_ms.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = if totals.latencies_ms.is_empty() {
        0.0
    } else {
        totals.latencies_ms.iter().sum::<f64>() / totals.latencies_ms.len() as f64
    };

    println!("Keep-alive load run");
    println!("addr: {}", config.addr);
    println!("path: {}", config.path);
    println!("method: {}", config.method);
    println!("concurrency: {}", config.concurrency);
    println!("duration: {}", format_duration(config.duration));
    println!("total_requests: {attempted}");
    println!("successful_requests: {}", totals.success);
    println!("failed_requests: {}", totals.failed);
    println!("failed_on_reused_connection: {}", totals.reuse_failures);
    println!("connections_opened: {}", totals.connections_opened);
    println!("close_advertised: {}", totals.close_advertised);
    println!(
        "success_rate_pct: {:.2}",
        (totals.success as f64 / attempted as f64) * 100.0
    );
    println!("elapsed_seconds: {:.4}", elapsed_seconds);
    println!(
        "throughput_rps: {:.2}",
        totals.success as f64 / elapsed_seconds.max(0.0001)
    );
    println!("latency_avg_ms: {:.4}", avg_ms);
    println!("latency_p50_ms: {:.4}", percentile(&totals.latencies_ms, 0.50));
    println!("latency_p95_ms: {:.4}", percentile(&totals.latencies_ms, 0.95));
    println!("latency_p99_ms: {:.4}", percentile(&totals.latencies_ms, 0.99));

    if totals.failed > 0 {
        for err in errors {
            println!("error_sample: {err}");
        }
        return Err(format!("{} requests failed", totals.failed));
    }

    Ok(())
}

fn run_worker(config: &Config, socket_addr: SocketAddr, deadline: Instant) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let mut connection: Option<Connection> = None;

    while Instant::now() < deadline {
        let mut current = match connection.take() {
            Some(current) => current,
            None => match open_connection(socket_addr, config) {
                Ok(opened) => {
                    stats.connections_opened += 1;
                    opened
                }
                Err(err) => {
                    stats.failed += 1;
                    stats.record_error(err);
                    continue;
                }
            },
        };

        let reused = current.served > 0;
        let req_started = Instant::now();
        match exchange(&mut current, config) {
            Exchange::Reply { status, keep_alive } => {
                current.served += 1;
                if status == 200 {
                    stats.success += 1;
                    stats
                        .latencies_ms
                        .push(req_started.elapsed().as_secs_f64() * 1000.0);
                } else {
                    stats.failed += 1;
                    stats.record_error(format!("unexpected HTTP status code: {status}"));
                }
                if keep_alive {
                    connection = Some(current);
                } else {
                    stats.close_advertised += 1;
                }
            }
            Exchange::Failed(err) => {
                stats.failed += 1;
                if reused {
                    stats.reuse_failures += 1;
                    stats.record_error(format!(
                        "{err} (after {} requests on this connection)",
                        current.served
                    ));
                } else {
                    stats.record_error(err);
                }
            }
        }
    }
    stats
}

fn open_connection(socket_addr: SocketAddr, config: &Config) -> Result<Connection, String> {
    let stream = TcpStream::connect_timeout(
        &socket_addr,
        Duration::from_millis(config.connect_timeout_ms),
    )
    .map_err(|e| format!("connect failed: {e}"))?;
    stream
        .set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms)))
        .map_err(|e| format!("set_read_timeout failed: {e}"))?;
    stream
        .set_write_timeout(Some(Duration::from_millis(config.read_timeout_ms)))
        .map_err(|e| format!("set_write_timeout failed: {e}"))?;
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay failed: {e}"))?;
    Ok(Connection {
        reader: BufReader::new(stream),
        served: 0,
    })
}

fn exchange(connection: &mut Connection, config: &Config) -> Exchange {
    let request = build_http_request(&config.method, &config.addr, &config.path);
    if let Err(err) = connection.reader.get_mut().write_all(request.as_bytes()) {
        return Exchange::Failed(format!("write failed: {err}"));
    }

    let head = match read_response_head(&mut connection.reader) {
        Ok(head) => head,
        Err(err) => return Exchange::Failed(format!("read failed: {err}")),
    };
    let framing = head.body_framing(&config.method);
    let mut body = Vec::new();
    let drained = match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(length) => (&mut connection.reader)
            .take(length)
            .read_to_end(&mut body)
            .and_then(|read| {
                if read as u64 == length {
                    Ok(())
                } else {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "body shorter than its content-length",
                    ))
                }
            }),
        BodyFraming::Chunked => ChunkedReader::new(&mut connection.reader)
            .read_to_end(&mut body)
            .map(|_| ()),
        BodyFraming::UntilClose => connection.reader.read_to_end(&mut body).map(|_| ()),
    };
    if let Err(err) = drained {
        return Exchange::Failed(format!("body read failed: {err}"));
    }

    Exchange::Reply {
        status: head.status,
        keep_alive: head.keeps_alive() && framing != BodyFraming::UntilClose,
    }
}

fn build_http_request(method: &str, addr: &str, path: &str) -> String {
    format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nAccept: */*\r\n\r\n")
}

fn resolve(addr: &str) -> Result<SocketAddr, String> {
    addr.to_socket_addrs()
        .map_err(|e| format!("unable to resolve addr '{addr}': {e}"))?
        .next()
        .ok_or_else(|| format!("unable to resolve addr '{addr}'"))
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (((sorted.len() - 1) as f64) * quantile).round() as usize;
    sorted[idx]
}

fn parse_args<I>(args: I) -> Result<Config, String>
where
    I: Iterator<Item = String>,
{
    let mut config = Config {
        addr: "127.0.0.1:8080".to_string(),
        path: "/sleep?min=10ms&max=50ms".to_string(),
        method: "GET".to_string(),
        concurrency: 16,
        duration: Duration::from_secs(10),
        connect_timeout_ms: 2_000,
        read_timeout_ms: 5_000,
    };

    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--addr" => {
                config.addr = args
                    .next()
                    .ok_or_else(|| "Missing value for --addr".to_string())?;
            }
            "--path" => {
                config.path = args
                    .next()
                    .ok_or_else(|| "Missing value for --path".to_string())?;
            }
            "--method" => {
                let method = args
                    .next()
                    .ok_or_else(|| "Missing value for --method".to_string())?;
                config.method = parse_method(&method)?;
            }
            "--concurrency" => {
                config.concurrency = parse_usize_arg(&mut args, "--concurrency")?;
            }
            "--duration" => {
                let raw = args
                    .next()
                    .ok_or_else(|| "Missing value for --duration".to_string())?;
                config.duration = parse_duration(&raw)
                    .map_err(|e| format!("Invalid value for --duration: {e}"))?;
            }
            "--connect-timeout-ms" => {
                config.connect_timeout_ms = parse_u64_arg(&mut args, "--connect-timeout-ms")?;
            }
            "--read-timeout-ms" => {
                config.read_timeout_ms = parse_u64_arg(&mut args, "--read-timeout-ms")?;
            }
            "--help" | "-h" => return Err(usage_text().to_string()),
            _ => return Err(format!("Unknown argument '{arg}'.\n\n{}", usage_text())),
        }
    }

    if !config.path.starts_with('/') {
        return Err("--path must start with '/'".to_string());
    }
    if config.duration.is_zero() {
        return Err("--duration must be > 0".to_string());
    }

    Ok(config)
}

fn parse_method(raw: &str) -> Result<String, String> {
    let normalized = raw.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "GET" | "POST" | "HEAD" => Ok(normalized),
        _ => Err(format!(
            "Unsupported --method '{raw}' (allowed: GET, POST, HEAD)"
        )),
    }
}

fn parse_usize_arg<I>(args: &mut I, flag: &str) -> Result<usize, String>
where
    I: Iterator<Item = String>,
{
    let raw = args
        .next()
        .ok_or_else(|| format!("Missing value for {flag}"))?;
    let value = raw
        .parse::<usize>()
        .map_err(|_| format!("Invalid value for {flag}: {raw}"))?;
    if value == 0 {
        return Err(format!("{flag} must be > 0"));
    }
    Ok(value)
}

fn parse_u64_arg<I>(args: &mut I, flag: &str) -> Result<u64, String>
where
    I: Iterator<Item = String>,
{
    let raw = args
        .next()
        .ok_or_else(|| format!("Missing value for {flag}"))?;
    let value = raw
        .parse::<u64>()
        .map_err(|_| format!("Invalid value for {flag}: {raw}"))?;
    if value == 0 {
        return Err(format!("{flag} must be > 0"));
    }
    Ok(value)
}

fn usage_text() -> &'static str {
    "Usage: cargo run -p keepalive-load -- [--addr HOST:PORT] [--path /sleep?...] [--method GET|POST|HEAD] [--concurrency N] [--duration 10s] [--connect-timeout-ms N] [--read-timeout-ms N]"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> impl Iterator<Item = String> {
        raw.iter()
            .map(|arg| arg.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn parse_args_applies_flags_over_defaults() {
        let config = parse_args(args(&[
            "--addr",
            "10.0.0.1:9000",
            "--method",
            "post",
            "--concurrency",
            "4",
            "--duration",
            "1m30s",
        ]))
        .unwrap();

        assert_eq!(config.addr, "10.0.0.1:9000");
        assert_eq!(config.method, "POST");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.duration, Duration::from_secs(90));
        assert_eq!(config.path, "/sleep?min=10ms&max=50ms");
    }

    #[test]
    fn parse_args_rejects_bad_values() {
        assert!(parse_args(args(&["--concurrency", "0"])).is_err());
        assert!(parse_args(args(&["--duration", "0s"])).is_err());
        assert!(parse_args(args(&["--duration", "soon"])).is_err());
        assert!(parse_args(args(&["--path", "ready"])).is_err());
        assert!(parse_args(args(&["--method", "PATCH"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }

    #[test]
    fn percentile_picks_nearest_rank() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.50), 3.0);
        assert_eq!(percentile(&sorted, 0.99), 5.0);
        assert_eq!(percentile(&[], 0.50), 0.0);
    }
}
