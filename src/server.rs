//! The collector server's HTTP surface.
//!
//! Routing stays thin: a handful of accept threads pull requests off a
//! `tiny_http` listener, unwrap the envelope (hash check first, then
//! gunzip, then decrypt), and dispatch to the transport-agnostic operations
//! in `ops`. Those operations own the accumulation semantics and are the
//! same functions a parallel RPC transport would mount.

use crate::config::ServerConfig;
use crate::envelope::{self, hash, Opener};
use crate::error::Error;
use crate::metric::{Metric, MetricKind};
use crate::storage::Storage;
use crossbeam::channel::{Receiver, TryRecvError};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Accept-thread count for the listener.
const ACCEPT_WORKERS: usize = 4;
/// How long an accept thread waits before re-checking shutdown.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

/// Transport-agnostic server operations.
///
/// Every handler validates its input, applies the accumulation rules
/// through `Storage::set`/`set_all` and reports failures as typed errors;
/// the HTTP layer only translates those to status codes.
pub mod ops {
    use super::*;
    use std::collections::HashMap;

    /// Apply a path-encoded update: kind, name and value arrive as raw
    /// strings. The raw gauge literal is preserved as the display string.
    pub fn update_path(
        storage: &dyn Storage,
        kind: &str,
        name: &str,
        value: &str,
    ) -> Result<(), Error> {
        let metric = match kind {
            "gauge" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| Error::InvalidKind(format!("bad gauge value {}", value)))?;
                Metric::gauge_with_display(name, parsed, value)
            }
            "counter" => {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| Error::InvalidKind(format!("bad counter value {}", value)))?;
                Metric::counter(name, parsed)
            }
            other => return Err(Error::InvalidKind(other.to_string())),
        };
        storage.set(metric)
    }

    /// Apply a JSON-encoded single-metric update and answer with the
    /// merged state of that metric.
    pub fn update_json(storage: &dyn Storage, mut metric: Metric) -> Result<Metric, Error> {
        metric.validate()?;
        if metric.kind == MetricKind::Gauge {
            if let Some(v) = metric.value {
                metric.display = Some(format!("{:.6}", v));
            }
        }
        let name = metric.name.clone();
        storage.set(metric)?;
        storage.get(&name)
    }

    /// Apply a JSON-encoded batch in one storage call.
    ///
    /// Repeated counter names inside the batch are collapsed into one
    /// summed delta first; `set_all` then merges the collapsed batch
    /// against stored state, transactionally where the backend allows.
    pub fn update_batch(storage: &dyn Storage, metrics: Vec<Metric>) -> Result<(), Error> {
        let mut collapsed: HashMap<String, Metric> = HashMap::new();
        for metric in metrics {
            metric.validate()?;
            match collapsed.get_mut(&metric.name) {
                Some(existing) => *existing += metric,
                None => {
                    collapsed.insert(metric.name.clone(), metric);
                }
            }
        }
        storage.set_all(collapsed)
    }

    /// Fetch one metric for a JSON response.
    pub fn value_json(storage: &dyn Storage, name: &str) -> Result<Metric, Error> {
        storage.get(name)
    }

    /// Fetch one metric's display string.
    pub fn value_display(storage: &dyn Storage, name: &str) -> Result<String, Error> {
        storage.get(name)?.display_value()
    }

    /// Render every stored metric as an HTML list, sorted by name.
    pub fn list_html(storage: &dyn Storage) -> Result<String, Error> {
        let all = storage.get_all()?;
        let mut names: Vec<&String> = all.keys().collect();
        names.sort();

        let mut out = String::from("<html><body><ul>");
        for name in names {
            let value = match all[name].display_value() {
                Ok(v) => v,
                Err(_) => "Not found".to_string(),
            };
            out.push_str(&format!("<li>{}: {}</li>", name, value));
        }
        out.push_str("</ul></body></html>");
        Ok(out)
    }

    /// Probe the storage backend.
    pub fn ping(storage: &dyn Storage) -> Result<(), Error> {
        storage.ping()
    }
}

/// An IPv4/IPv6 CIDR block for the `X-Real-IP` check.
#[derive(Debug, Clone)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    /// Parse `addr/prefix` notation.
    pub fn parse(cidr: &str) -> Result<Subnet, Error> {
        let mut parts = cidr.splitn(2, '/');
        let addr = parts.next().unwrap_or("");
        let prefix = parts
            .next()
            .ok_or_else(|| Error::Storage(format!("bad CIDR {}", cidr)))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|_| Error::Storage(format!("bad CIDR {}", cidr)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::Storage(format!("bad CIDR {}", cidr)))?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(Error::Storage(format!("bad CIDR {}", cidr)));
        }
        Ok(Subnet { network, prefix })
    }

    /// True when `ip` falls inside the block.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// The HTTP server wiring: listener, storage, envelope opener and the
/// request policy knobs.
pub struct Server {
    listener: Arc<tiny_http::Server>,
    storage: Arc<dyn Storage>,
    opener: Arc<Opener>,
    hash_key: Option<String>,
    trusted_subnet: Option<Subnet>,
}

impl Server {
    /// Bind the listener. A busy port is fatal here, at startup.
    pub fn new(
        config: &ServerConfig,
        storage: Arc<dyn Storage>,
        opener: Opener,
    ) -> Result<Server, Error> {
        let listener = tiny_http::Server::http(&config.address)
            .map_err(|e| Error::Storage(format!("binding {}: {}", config.address, e)))?;
        let trusted_subnet = match config.trusted_subnet {
            Some(ref cidr) => Some(Subnet::parse(cidr)?),
            None => None,
        };
        Ok(Server {
            listener: Arc::new(listener),
            storage,
            opener: Arc::new(opener),
            hash_key: config.hash_key.clone().filter(|k| !k.is_empty()),
            trusted_subnet,
        })
    }

    /// The bound listen address, useful when binding port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.server_addr().to_ip()
    }

    /// Serve until the shutdown channel closes.
    pub fn run(&self, shutdown: Receiver<()>) {
        let workers: Vec<thread::JoinHandle<()>> = (0..ACCEPT_WORKERS)
            .map(|i| {
                let listener = Arc::clone(&self.listener);
                let storage = Arc::clone(&self.storage);
                let opener = Arc::clone(&self.opener);
                let hash_key = self.hash_key.clone();
                let trusted_subnet = self.trusted_subnet.clone();
                let shutdown = shutdown.clone();
                thread::Builder::new()
                    .name(format!("ingot-http-{}", i))
                    .spawn(move || loop {
                        if let Err(TryRecvError::Disconnected) = shutdown.try_recv() {
                            return;
                        }
                        match listener.recv_timeout(ACCEPT_POLL) {
                            Ok(Some(request)) => handle(
                                request,
                                &*storage,
                                &opener,
                                hash_key.as_deref(),
                                trusted_subnet.as_ref(),
                            ),
                            Ok(None) => {}
                            Err(e) => {
                                error!("listener receive failed: {}", e);
                                return;
                            }
                        }
                    })
                    .expect("failed to spawn accept worker")
            })
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("accept worker panicked");
            }
        }
        info!("http server stopped");
    }
}

fn header_value(request: &tiny_http::Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str().to_string())
}

fn status_for(err: &Error) -> u16 {
    match err {
        Error::NotFound => 404,
        Error::InvalidKind(_)
        | Error::Payload(_)
        | Error::Integrity
        | Error::Encryption(_) => 400,
        Error::Transient(_) | Error::Storage(_) | Error::Persistence(_) => 500,
    }
}

/// What a handler wants sent back, before response-side encoding.
struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn ok_empty() -> Reply {
        Reply {
            status: 200,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    fn ok_text(body: String) -> Reply {
        Reply {
            status: 200,
            content_type: "text/plain",
            body: body.into_bytes(),
        }
    }

    fn ok_html(body: String) -> Reply {
        Reply {
            status: 200,
            content_type: "text/html",
            body: body.into_bytes(),
        }
    }

    fn ok_json(value: &impl serde::Serialize) -> Reply {
        match serde_json::to_vec(value) {
            Ok(body) => Reply {
                status: 200,
                content_type: "application/json",
                body,
            },
            Err(e) => Reply::error(&Error::Storage(e.to_string())),
        }
    }

    fn error(err: &Error) -> Reply {
        Reply {
            status: status_for(err),
            content_type: "text/plain",
            body: err.to_string().into_bytes(),
        }
    }

    fn forbidden() -> Reply {
        Reply {
            status: 403,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }
}

fn handle(
    mut request: tiny_http::Request,
    storage: &dyn Storage,
    opener: &Opener,
    hash_key: Option<&str>,
    trusted_subnet: Option<&Subnet>,
) {
    let mut body = Vec::new();
    if let Err(e) = request.as_reader().read_to_end(&mut body) {
        warn!("failed to read request body: {}", e);
        respond(request, Reply::error(&Error::Payload(e.to_string())), false, hash_key);
        return;
    }

    let accept_gzip = header_value(&request, "Accept-Encoding")
        .map(|v| v.split(',').any(|t| t.trim() == "gzip"))
        .unwrap_or(false);

    if let Some(subnet) = trusted_subnet {
        let allowed = header_value(&request, "X-Real-IP")
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .map(|ip| subnet.contains(ip))
            .unwrap_or(false);
        if !allowed {
            warn!("rejecting request from outside the trusted subnet");
            respond(request, Reply::forbidden(), accept_gzip, hash_key);
            return;
        }
    }

    let content_encoding = header_value(&request, "Content-Encoding");
    let received_hash = header_value(&request, hash::HASH_HEADER);
    let opened = match opener.open(
        &body,
        content_encoding.as_deref(),
        received_hash.as_deref(),
    ) {
        Ok(data) => data,
        Err(e) => {
            warn!("rejecting request: {}", e);
            respond(request, Reply::error(&e), accept_gzip, hash_key);
            return;
        }
    };

    let reply = route(&request, &opened, storage);
    respond(request, reply, accept_gzip, hash_key);
}

fn route(request: &tiny_http::Request, body: &[u8], storage: &dyn Storage) -> Reply {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("");
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (tiny_http::Method::Post, ["update", kind, name, value]) => {
            match ops::update_path(storage, kind, name, value) {
                Ok(()) => Reply::ok_empty(),
                Err(e) => Reply::error(&e),
            }
        }
        (tiny_http::Method::Post, ["update"]) => {
            let metric: Metric = match serde_json::from_slice(body) {
                Ok(m) => m,
                Err(e) => return Reply::error(&Error::Payload(e.to_string())),
            };
            match ops::update_json(storage, metric) {
                Ok(stored) => Reply::ok_json(&stored),
                Err(e) => Reply::error(&e),
            }
        }
        (tiny_http::Method::Post, ["updates"]) => {
            let metrics: Vec<Metric> = match serde_json::from_slice(body) {
                Ok(m) => m,
                Err(e) => return Reply::error(&Error::Payload(e.to_string())),
            };
            match ops::update_batch(storage, metrics.clone()) {
                Ok(()) => Reply::ok_json(&metrics),
                Err(e) => Reply::error(&e),
            }
        }
        (tiny_http::Method::Post, ["value"]) => {
            // lookups only need the id; clients may omit the rest
            #[derive(serde::Deserialize)]
            struct Probe {
                id: String,
            }
            let probe: Probe = match serde_json::from_slice(body) {
                Ok(m) => m,
                Err(e) => return Reply::error(&Error::Payload(e.to_string())),
            };
            match ops::value_json(storage, &probe.id) {
                Ok(metric) => Reply::ok_json(&metric),
                Err(e) => Reply::error(&e),
            }
        }
        (tiny_http::Method::Get, ["value", _kind, name]) => {
            match ops::value_display(storage, name) {
                Ok(value) => Reply::ok_text(value),
                Err(e) => Reply::error(&e),
            }
        }
        (tiny_http::Method::Get, ["value", name]) => {
            match ops::value_display(storage, name) {
                Ok(value) => Reply::ok_text(value),
                Err(e) => Reply::error(&e),
            }
        }
        (tiny_http::Method::Get, [""]) => match ops::list_html(storage) {
            Ok(html) => Reply::ok_html(html),
            Err(e) => Reply::error(&e),
        },
        (tiny_http::Method::Get, ["ping"]) => match ops::ping(storage) {
            Ok(()) => Reply::ok_empty(),
            Err(e) => Reply::error(&Error::Storage(e.to_string())),
        },
        _ => Reply {
            status: 404,
            content_type: "text/plain",
            body: Vec::new(),
        },
    }
}

fn respond(request: tiny_http::Request, reply: Reply, accept_gzip: bool, hash_key: Option<&str>) {
    let mut body = reply.body;
    let mut response_gzipped = false;
    if accept_gzip && !body.is_empty() {
        match envelope::gzip(&body) {
            Ok(compressed) => {
                body = compressed;
                response_gzipped = true;
            }
            Err(e) => warn!("response compression failed: {}", e),
        }
    }

    let mut response = tiny_http::Response::from_data(body.clone())
        .with_status_code(reply.status);
    response = response.with_header(
        tiny_http::Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes())
            .expect("static header"),
    );
    if response_gzipped {
        response = response.with_header(
            tiny_http::Header::from_bytes(&b"Content-Encoding"[..], &b"gzip"[..])
                .expect("static header"),
        );
    }
    if let Some(key) = hash_key {
        response = response.with_header(
            tiny_http::Header::from_bytes(
                hash::HASH_HEADER.as_bytes(),
                hash::tag(&body, key).as_bytes(),
            )
            .expect("static header"),
        );
    }
    if let Err(e) = request.respond(response) {
        warn!("failed to write response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn storage() -> MemoryStorage {
        MemoryStorage::new()
    }

    #[test]
    fn path_update_preserves_gauge_literal() {
        let store = storage();
        ops::update_path(&store, "gauge", "Alloc", "1.100").unwrap();
        assert_eq!(ops::value_display(&store, "Alloc").unwrap(), "1.100");
    }

    #[test]
    fn path_update_accumulates_counters() {
        let store = storage();
        ops::update_path(&store, "counter", "PollCount", "1").unwrap();
        ops::update_path(&store, "counter", "PollCount", "1").unwrap();
        assert_eq!(store.get("PollCount").unwrap().delta, Some(2));
        assert_eq!(ops::value_display(&store, "PollCount").unwrap(), "2");
    }

    #[test]
    fn path_update_rejects_bad_kind_and_bad_value() {
        let store = storage();
        assert!(matches!(
            ops::update_path(&store, "histogram", "x", "1"),
            Err(Error::InvalidKind(_))
        ));
        assert!(matches!(
            ops::update_path(&store, "gauge", "x", "not-a-number"),
            Err(Error::InvalidKind(_))
        ));
        assert!(matches!(
            ops::update_path(&store, "counter", "x", "1.5"),
            Err(Error::InvalidKind(_))
        ));
    }

    #[test]
    fn json_update_echoes_merged_state() {
        let store = storage();
        ops::update_json(&store, Metric::counter("c", 3)).unwrap();
        let merged = ops::update_json(&store, Metric::counter("c", 4)).unwrap();
        assert_eq!(merged.delta, Some(7));
    }

    #[test]
    fn json_gauge_gets_six_decimal_display() {
        let store = storage();
        let stored = ops::update_json(&store, Metric::gauge("g", 2.5)).unwrap();
        assert_eq!(stored.display.as_deref(), Some("2.500000"));
    }

    #[test]
    fn batch_collapses_repeated_counters() {
        let store = storage();
        store.set(Metric::counter("c", 10)).unwrap();
        ops::update_batch(
            &store,
            vec![
                Metric::counter("c", 1),
                Metric::gauge("g", 1.0),
                Metric::counter("c", 2),
                Metric::gauge("g", 2.0),
            ],
        )
        .unwrap();
        assert_eq!(store.get("c").unwrap().delta, Some(13));
        assert_eq!(store.get("g").unwrap().value, Some(2.0));
    }

    #[test]
    fn batch_rejects_invalid_members() {
        let store = storage();
        let bad = Metric {
            name: "broken".to_string(),
            kind: MetricKind::Counter,
            delta: None,
            value: Some(1.0),
            display: None,
        };
        assert!(ops::update_batch(&store, vec![bad]).is_err());
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn value_of_unknown_metric_is_not_found() {
        let store = storage();
        assert!(matches!(
            ops::value_display(&store, "ghost"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn html_listing_is_sorted_and_complete() {
        let store = storage();
        store.set(Metric::counter("beta", 2)).unwrap();
        store.set(Metric::gauge("alpha", 1.5)).unwrap();
        let html = ops::list_html(&store).unwrap();
        assert!(html.starts_with("<html><body><ul>"));
        assert!(html.ends_with("</ul></body></html>"));
        let alpha = html.find("alpha: 1.500000").unwrap();
        let beta = html.find("beta: 2").unwrap();
        assert!(alpha < beta);
    }

    #[test]
    fn subnet_contains_v4() {
        let subnet = Subnet::parse("10.0.0.0/8").unwrap();
        assert!(subnet.contains("10.1.2.3".parse().unwrap()));
        assert!(!subnet.contains("11.0.0.1".parse().unwrap()));
        assert!(!subnet.contains("::1".parse().unwrap()));
    }

    #[test]
    fn subnet_contains_v6() {
        let subnet = Subnet::parse("fd00::/8").unwrap();
        assert!(subnet.contains("fd00::1".parse().unwrap()));
        assert!(!subnet.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn subnet_rejects_garbage() {
        assert!(Subnet::parse("10.0.0.0").is_err());
        assert!(Subnet::parse("10.0.0.0/33").is_err());
        assert!(Subnet::parse("banana/8").is_err());
    }

    #[test]
    fn error_statuses_match_the_taxonomy() {
        assert_eq!(status_for(&Error::NotFound), 404);
        assert_eq!(status_for(&Error::InvalidKind("x".into())), 400);
        assert_eq!(status_for(&Error::Integrity), 400);
        assert_eq!(status_for(&Error::Payload("x".into())), 400);
        assert_eq!(status_for(&Error::Encryption("x".into())), 400);
        assert_eq!(status_for(&Error::Transient("x".into())), 500);
        assert_eq!(status_for(&Error::Storage("x".into())), 500);
    }
}
