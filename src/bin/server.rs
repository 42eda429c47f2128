#[macro_use]
extern crate log;

use chrono::Utc;
use crossbeam::channel::bounded;
use ingot::config;
use ingot::envelope::crypto;
use ingot::envelope::Opener;
use ingot::server::Server;
use ingot::snapshot::Snapshotter;
use ingot::storage::{MemoryStorage, PostgresStorage, Storage};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on the listener/snapshotter join during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn init_logging(verbose: u64) {
    let level = match verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.target(),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("could not set up logging");
}

fn main() {
    let args = config::parse_server_args();
    init_logging(args.verbose);
    info!("ingot-server - {}", config::version());

    if let Some(ref public_path) = args.generate_public_key_to {
        let private_path = match args.private_key_path {
            Some(ref p) => p,
            None => {
                error!("--generate-keys needs --crypto-key for the private half");
                process::exit(1);
            }
        };
        if let Err(e) =
            crypto::generate_key_pair(crypto::DEFAULT_KEY_BITS, private_path, public_path)
        {
            error!("key generation failed: {}", e);
            process::exit(1);
        }
        info!(
            "wrote key pair: private {:?}, public {:?}",
            private_path, public_path
        );
        return;
    }

    let opener = match Opener::new(args.private_key_path.as_deref(), args.hash_key.clone()) {
        Ok(opener) => opener,
        Err(e) => {
            error!("could not set up the wire envelope: {}", e);
            process::exit(1);
        }
    };

    let storage: Arc<dyn Storage> = match args.database_dsn {
        Some(ref dsn) => match PostgresStorage::connect(dsn) {
            Ok(backend) => {
                info!("using the relational backend");
                Arc::new(backend)
            }
            Err(e) => {
                error!("could not reach the database: {}", e);
                process::exit(1);
            }
        },
        None => {
            info!("using the in-memory backend");
            Arc::new(MemoryStorage::new())
        }
    };

    let (stop_tx, stop_rx) = bounded::<()>(0);
    let mut handles = Vec::new();

    if let Some(ref path) = args.snapshot_path {
        let snapshotter = Snapshotter::new(
            Arc::clone(&storage),
            path.clone(),
            args.snapshot_tmp_dir.clone(),
            args.store_interval(),
        );
        // replay before the listener accepts anything
        if args.restore {
            if let Err(e) = snapshotter.restore() {
                warn!("snapshot restore failed: {}", e);
            }
        }
        let stop = stop_rx.clone();
        handles.push(
            thread::Builder::new()
                .name("ingot-snapshot".to_string())
                .spawn(move || snapshotter.run(stop))
                .expect("failed to spawn snapshotter"),
        );
    }

    let server = match Server::new(&args, Arc::clone(&storage), opener) {
        Ok(server) => server,
        Err(e) => {
            error!("could not start the listener: {}", e);
            process::exit(1);
        }
    };
    info!("listening on {}", args.address);
    {
        let stop = stop_rx.clone();
        handles.push(
            thread::Builder::new()
                .name("ingot-http".to_string())
                .spawn(move || server.run(stop))
                .expect("failed to spawn http server"),
        );
    }
    drop(stop_rx);

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("could not register signal handler");
    signals.forever().next();
    info!("shutdown signal received");
    drop(stop_tx);

    let (done_tx, done_rx) = bounded::<()>(0);
    thread::spawn(move || {
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
        let _ = done_tx.send(());
    });
    match done_rx.recv_timeout(SHUTDOWN_GRACE) {
        Ok(()) => info!("drained, exiting"),
        Err(_) => warn!("shutdown timed out after {:?}, exiting anyway", SHUTDOWN_GRACE),
    }

    storage.close();
}
