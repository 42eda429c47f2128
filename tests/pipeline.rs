//! End-to-end pipeline tests: agent-side delivery through the wire
//! envelope into a live server and back out through the query surface.

use crossbeam::channel::bounded;
use ingot::config::ServerConfig;
use ingot::envelope::{crypto, hash, Opener, Sealer};
use ingot::metric::Metric;
use ingot::server::Server;
use ingot::sink::{HttpTransport, Transport};
use ingot::storage::{MemoryStorage, Storage};
use std::sync::Arc;
use std::thread;

struct RunningServer {
    address: String,
    stop: Option<crossbeam::channel::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
    storage: Arc<MemoryStorage>,
}

impl RunningServer {
    fn start(hash_key: Option<String>, private_key: Option<std::path::PathBuf>) -> RunningServer {
        let storage = Arc::new(MemoryStorage::new());
        let config = ServerConfig {
            address: "127.0.0.1:0".to_string(),
            hash_key: hash_key.clone(),
            private_key_path: private_key.clone(),
            ..ServerConfig::default()
        };
        let opener = Opener::new(private_key.as_deref(), hash_key).unwrap();
        let server = Server::new(
            &config,
            Arc::clone(&storage) as Arc<dyn Storage>,
            opener,
        )
        .unwrap();
        let address = server.local_addr().expect("bound address").to_string();

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::spawn(move || server.run(stop_rx));
        RunningServer {
            address,
            stop: Some(stop_tx),
            handle: Some(handle),
            storage,
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn plain_delivery_accumulates_on_the_server() {
    let server = RunningServer::start(None, None);
    let sealer = Sealer::new(None, None).unwrap();
    let transport = HttpTransport::new(&server.address, sealer).unwrap();

    transport.deliver(Metric::counter("PollCount", 1)).unwrap();
    transport.deliver(Metric::counter("PollCount", 1)).unwrap();
    transport
        .deliver(Metric::gauge_with_display("RandomValue", 0.25, "0.25"))
        .unwrap();

    assert_eq!(server.storage.get("PollCount").unwrap().delta, Some(2));
    assert_eq!(server.storage.get("RandomValue").unwrap().value, Some(0.25));

    let client = reqwest::blocking::Client::new();
    let text = client
        .get(format!("http://{}/value/counter/PollCount", server.address))
        .send()
        .unwrap()
        .text()
        .unwrap();
    assert_eq!(text, "2");
}

#[test]
fn unknown_metric_is_a_404() {
    let server = RunningServer::start(None, None);
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://{}/value/gauge/ghost", server.address))
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[test]
fn listing_renders_every_metric() {
    let server = RunningServer::start(None, None);
    server.storage.set(Metric::counter("hits", 3)).unwrap();
    server.storage.set(Metric::gauge("load", 0.5)).unwrap();

    let client = reqwest::blocking::Client::new();
    let html = client
        .get(format!("http://{}/", server.address))
        .send()
        .unwrap()
        .text()
        .unwrap();
    assert!(html.contains("<li>hits: 3</li>"));
    assert!(html.contains("<li>load: 0.500000</li>"));
}

#[test]
fn hashed_and_encrypted_delivery_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let private_path = dir.path().join("private.pem");
    let public_path = dir.path().join("public.pem");
    // 1024-bit keys keep unoptimized keygen quick
    crypto::generate_key_pair(1024, &private_path, &public_path).unwrap();

    let key = "wire-secret".to_string();
    let server = RunningServer::start(Some(key.clone()), Some(private_path));
    let sealer = Sealer::new(Some(&public_path), Some(key.clone())).unwrap();
    let transport = HttpTransport::new(&server.address, sealer).unwrap();

    transport.deliver(Metric::counter("sealed", 5)).unwrap();
    assert_eq!(server.storage.get("sealed").unwrap().delta, Some(5));

    // reads must carry the integrity tag too once a key is configured
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(format!("http://{}/value/counter/sealed", server.address))
        .header(hash::HASH_HEADER, hash::tag(b"", &key))
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().unwrap(), "5");
}

#[test]
fn tampered_hash_is_rejected() {
    let key = "wire-secret".to_string();
    let server = RunningServer::start(Some(key), None);

    let body = serde_json::to_vec(&[Metric::counter("evil", 1)]).unwrap();
    let client = reqwest::blocking::Client::new();
    let response = client
        .post(format!("http://{}/updates/", server.address))
        .header("Content-Type", "application/json")
        .header(hash::HASH_HEADER, "0000deadbeef")
        .body(body)
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert!(server.storage.get("evil").is_err());
}

#[test]
fn out_of_subnet_requests_are_forbidden() {
    let storage = Arc::new(MemoryStorage::new());
    let config = ServerConfig {
        address: "127.0.0.1:0".to_string(),
        trusted_subnet: Some("10.0.0.0/8".to_string()),
        ..ServerConfig::default()
    };
    let opener = Opener::new(None, None).unwrap();
    let server = Server::new(&config, Arc::clone(&storage) as Arc<dyn Storage>, opener).unwrap();
    let address = server.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let handle = thread::spawn(move || server.run(stop_rx));

    let client = reqwest::blocking::Client::new();
    let no_header = client
        .get(format!("http://{}/ping", address))
        .send()
        .unwrap();
    assert_eq!(no_header.status().as_u16(), 403);

    let outside = client
        .get(format!("http://{}/ping", address))
        .header("X-Real-IP", "192.168.1.1")
        .send()
        .unwrap();
    assert_eq!(outside.status().as_u16(), 403);

    let inside = client
        .get(format!("http://{}/ping", address))
        .header("X-Real-IP", "10.20.30.40")
        .send()
        .unwrap();
    assert_eq!(inside.status().as_u16(), 200);

    drop(stop_tx);
    handle.join().unwrap();
}

#[test]
fn batch_update_lands_in_one_call() {
    let server = RunningServer::start(None, None);
    let sealer = Sealer::new(None, None).unwrap();

    let batch = vec![
        Metric::counter("reqs", 2),
        Metric::gauge("temp", 21.5),
        Metric::counter("reqs", 3),
    ];
    let payload = serde_json::to_vec(&batch).unwrap();
    let sealed = sealer.seal(&payload).unwrap();

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(format!("http://{}/updates/", server.address))
        .header("Content-Type", "application/json")
        .header("Content-Encoding", sealed.content_encoding)
        .body(sealed.body)
        .send()
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(server.storage.get("reqs").unwrap().delta, Some(5));
    assert_eq!(server.storage.get("temp").unwrap().value, Some(21.5));
}
