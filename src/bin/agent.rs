#[macro_use]
extern crate log;

use chrono::Utc;
use crossbeam::channel::{bounded, unbounded};
use ingot::config;
use ingot::envelope::Sealer;
use ingot::fanin;
use ingot::sink::{DeliveryPool, HttpTransport, Transport};
use ingot::source::{HostCollector, RuntimeCollector, Source};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on the pipeline join during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

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
    let args = config::parse_agent_args();
    init_logging(args.verbose);
    info!("ingot-agent - {}", config::version());

    let sealer = match Sealer::new(args.public_key_path.as_deref(), args.hash_key.clone()) {
        Ok(sealer) => sealer,
        Err(e) => {
            error!("could not set up the wire envelope: {}", e);
            process::exit(1);
        }
    };
    let transport = match HttpTransport::new(&args.address, sealer) {
        Ok(transport) => transport,
        Err(e) => {
            error!("could not set up the http transport: {}", e);
            process::exit(1);
        }
    };

    // One shared stop signal: dropping stop_tx broadcasts shutdown to every
    // stage at once.
    let (stop_tx, stop_rx) = bounded::<()>(0);

    let (runtime_tx, runtime_rx) = bounded(0);
    let (host_tx, host_rx) = bounded(0);
    let (merged_tx, merged_rx) = unbounded();

    let mut handles = Vec::new();
    {
        let stop = stop_rx.clone();
        let interval = args.poll_interval();
        handles.push(
            thread::Builder::new()
                .name("ingot-runtime".to_string())
                .spawn(move || RuntimeCollector::new(runtime_tx, interval).run(stop))
                .expect("failed to spawn runtime collector"),
        );
    }
    {
        let stop = stop_rx.clone();
        handles.push(
            thread::Builder::new()
                .name("ingot-host".to_string())
                .spawn(move || HostCollector::new(host_tx).run(stop))
                .expect("failed to spawn host collector"),
        );
    }
    handles.push(
        thread::Builder::new()
            .name("ingot-merge".to_string())
            .spawn(move || fanin::merge(runtime_rx, host_rx, merged_tx))
            .expect("failed to spawn merge stage"),
    );
    {
        let stop = stop_rx.clone();
        let pool = DeliveryPool::new(
            Arc::new(transport) as Arc<dyn Transport>,
            args.report_interval(),
            args.rate_limit,
        );
        handles.push(
            thread::Builder::new()
                .name("ingot-delivery".to_string())
                .spawn(move || pool.run(merged_rx, stop))
                .expect("failed to spawn delivery stage"),
        );
    }
    drop(stop_rx);

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("could not register signal handler");
    signals.forever().next();
    info!("shutdown signal received");
    drop(stop_tx);

    // The join itself runs on a watcher thread so the grace period can cap
    // it; a stage stuck past the bound is logged and abandoned.
    let (done_tx, done_rx) = bounded::<()>(0);
    thread::spawn(move || {
        for handle in handles {
            if handle.join().is_err() {
                error!("pipeline thread panicked during shutdown");
            }
        }
        let _ = done_tx.send(());
    });
    match done_rx.recv_timeout(SHUTDOWN_GRACE) {
        Ok(()) => info!("pipeline drained, exiting"),
        Err(_) => warn!("shutdown timed out after {:?}, exiting anyway", SHUTDOWN_GRACE),
    }
}
