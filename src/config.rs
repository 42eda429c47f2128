//! Configuration for the agent and server binaries.
//!
//! Settings come from three layers: built-in defaults, an optional TOML
//! file, then command-line flags, with environment variables applied last.
//! The result is a plain struct constructed once in `main` and passed by
//! reference to every component constructor -- there is no global
//! configuration state.

use clap::{App, Arg, ArgMatches};
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// Crate version for startup banners.
pub fn version() -> &'static str {
    VERSION.unwrap_or("unknown")
}

/// Everything the agent needs to run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// host:port of the collector server.
    pub address: String,
    /// Seconds between runtime-statistic samples.
    pub poll_interval: u64,
    /// Seconds between delivery cycles.
    pub report_interval: u64,
    /// Delivery worker count; also the job queue bound.
    pub rate_limit: usize,
    /// Shared secret for the integrity hash. Empty means no hashing.
    pub hash_key: Option<String>,
    /// PEM file holding the server's public key. Absent means no
    /// encryption.
    pub public_key_path: Option<PathBuf>,
    /// Log chattiness, 0 = errors only.
    pub verbose: u64,
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            address: "localhost:8080".to_string(),
            poll_interval: 2,
            report_interval: 10,
            rate_limit: 10,
            hash_key: None,
            public_key_path: None,
            verbose: 0,
        }
    }
}

impl AgentConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Report interval as a `Duration`.
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }
}

/// Everything the server needs to run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// host:port to listen on.
    pub address: String,
    /// Seconds between snapshot persists.
    pub store_interval: u64,
    /// Snapshot file destination. Absent disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// Directory for snapshot temp files; same filesystem as the
    /// destination keeps the swap atomic.
    pub snapshot_tmp_dir: PathBuf,
    /// Replay the snapshot at startup.
    pub restore: bool,
    /// PostgreSQL DSN. Absent selects the in-memory backend.
    pub database_dsn: Option<String>,
    /// Shared secret for the integrity hash. Empty means no hashing.
    pub hash_key: Option<String>,
    /// PEM file holding this server's private key. Absent means no
    /// decryption.
    pub private_key_path: Option<PathBuf>,
    /// CIDR the `X-Real-IP` header must fall in. Absent disables the
    /// check.
    pub trusted_subnet: Option<String>,
    /// Operator mode: generate a key pair instead of serving. The private
    /// half goes to `private_key_path`, the public half here.
    pub generate_public_key_to: Option<PathBuf>,
    /// Log chattiness, 0 = errors only.
    pub verbose: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: "localhost:8080".to_string(),
            store_interval: 300,
            snapshot_path: Some(PathBuf::from("/tmp/ingot-metrics.ndjson")),
            snapshot_tmp_dir: PathBuf::from("/tmp"),
            restore: true,
            database_dsn: None,
            hash_key: None,
            private_key_path: None,
            trusted_subnet: None,
            generate_public_key_to: None,
            verbose: 0,
        }
    }
}

impl ServerConfig {
    /// Store interval as a `Duration`.
    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval)
    }
}

/// The agent's slice of a TOML config file. Every field optional; present
/// fields override defaults.
#[derive(Debug, Default, Deserialize)]
pub struct AgentFile {
    /// See `AgentConfig::address`.
    pub address: Option<String>,
    /// See `AgentConfig::poll_interval`.
    pub poll_interval: Option<u64>,
    /// See `AgentConfig::report_interval`.
    pub report_interval: Option<u64>,
    /// See `AgentConfig::rate_limit`.
    pub rate_limit: Option<usize>,
    /// See `AgentConfig::hash_key`.
    pub hash_key: Option<String>,
    /// See `AgentConfig::public_key_path`.
    pub crypto_key: Option<PathBuf>,
}

/// The server's slice of a TOML config file.
#[derive(Debug, Default, Deserialize)]
pub struct ServerFile {
    /// See `ServerConfig::address`.
    pub address: Option<String>,
    /// See `ServerConfig::store_interval`.
    pub store_interval: Option<u64>,
    /// See `ServerConfig::snapshot_path`.
    pub store_file: Option<PathBuf>,
    /// See `ServerConfig::snapshot_tmp_dir`.
    pub store_tmp_dir: Option<PathBuf>,
    /// See `ServerConfig::restore`.
    pub restore: Option<bool>,
    /// See `ServerConfig::database_dsn`.
    pub database_dsn: Option<String>,
    /// See `ServerConfig::hash_key`.
    pub hash_key: Option<String>,
    /// See `ServerConfig::private_key_path`.
    pub crypto_key: Option<PathBuf>,
    /// See `ServerConfig::trusted_subnet`.
    pub trusted_subnet: Option<String>,
}

fn read_toml<T>(path: &str) -> T
where
    T: serde::de::DeserializeOwned,
{
    let mut raw = String::new();
    let mut file = File::open(path)
        .unwrap_or_else(|e| panic!("could not open config file {}: {}", path, e));
    file.read_to_string(&mut raw)
        .unwrap_or_else(|e| panic!("could not read config file {}: {}", path, e));
    toml::from_str(&raw)
        .unwrap_or_else(|e| panic!("could not parse config file {}: {}", path, e))
}

fn env_str(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env_str(name).and_then(|v| v.parse().ok())
}

/// Parse agent configuration from argv, an optional config file and the
/// environment.
pub fn parse_agent_args() -> AgentConfig {
    let matches = App::new("ingot-agent")
        .version(version())
        .about("Samples process and host metrics and pushes them to ingot-server")
        .arg(
            Arg::with_name("config-file")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to an ingot-agent TOML config file"),
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .help("host:port of the collector server"),
        )
        .arg(
            Arg::with_name("report-interval")
                .short("r")
                .long("report-interval")
                .takes_value(true)
                .help("Seconds between delivery cycles"),
        )
        .arg(
            Arg::with_name("poll-interval")
                .short("p")
                .long("poll-interval")
                .takes_value(true)
                .help("Seconds between runtime samples"),
        )
        .arg(
            Arg::with_name("rate-limit")
                .short("l")
                .long("rate-limit")
                .takes_value(true)
                .help("Delivery worker count"),
        )
        .arg(
            Arg::with_name("key")
                .short("k")
                .long("key")
                .takes_value(true)
                .help("Shared secret for the integrity hash"),
        )
        .arg(
            Arg::with_name("crypto-key")
                .long("crypto-key")
                .takes_value(true)
                .help("PEM file with the server's public key"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output"),
        )
        .get_matches();

    let file: AgentFile = match matches.value_of("config-file") {
        Some(path) => read_toml(path),
        None => AgentFile::default(),
    };

    let mut config = AgentConfig::default();
    config.verbose = matches.occurrences_of("verbose");
    apply_agent_file(&mut config, file);
    apply_agent_flags(&mut config, &matches);
    apply_agent_env(&mut config);
    config
}

fn apply_agent_file(config: &mut AgentConfig, file: AgentFile) {
    if let Some(v) = file.address {
        config.address = v;
    }
    if let Some(v) = file.poll_interval {
        config.poll_interval = v;
    }
    if let Some(v) = file.report_interval {
        config.report_interval = v;
    }
    if let Some(v) = file.rate_limit {
        config.rate_limit = v;
    }
    if file.hash_key.is_some() {
        config.hash_key = file.hash_key;
    }
    if file.crypto_key.is_some() {
        config.public_key_path = file.crypto_key;
    }
}

fn apply_agent_flags(config: &mut AgentConfig, matches: &ArgMatches) {
    if let Some(v) = matches.value_of("address") {
        config.address = v.to_string();
    }
    if let Some(v) = matches.value_of("report-interval") {
        config.report_interval = v.parse().expect("report-interval must be seconds");
    }
    if let Some(v) = matches.value_of("poll-interval") {
        config.poll_interval = v.parse().expect("poll-interval must be seconds");
    }
    if let Some(v) = matches.value_of("rate-limit") {
        config.rate_limit = v.parse().expect("rate-limit must be a count");
    }
    if let Some(v) = matches.value_of("key") {
        config.hash_key = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("crypto-key") {
        config.public_key_path = Some(PathBuf::from(v));
    }
}

fn apply_agent_env(config: &mut AgentConfig) {
    if let Some(v) = env_str("ADDRESS") {
        config.address = v;
    }
    if let Some(v) = env_parse("REPORT_INTERVAL") {
        config.report_interval = v;
    }
    if let Some(v) = env_parse("POLL_INTERVAL") {
        config.poll_interval = v;
    }
    if let Some(v) = env_parse("RATE_LIMIT") {
        config.rate_limit = v;
    }
    if let Some(v) = env_str("KEY") {
        config.hash_key = Some(v);
    }
    if let Some(v) = env_str("CRYPTO_KEY") {
        config.public_key_path = Some(PathBuf::from(v));
    }
}

/// Parse server configuration from argv, an optional config file and the
/// environment.
pub fn parse_server_args() -> ServerConfig {
    let matches = App::new("ingot-server")
        .version(version())
        .about("Collects pushed metrics, accumulates and persists them")
        .arg(
            Arg::with_name("config-file")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to an ingot-server TOML config file"),
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .help("host:port to listen on"),
        )
        .arg(
            Arg::with_name("store-interval")
                .short("i")
                .long("store-interval")
                .takes_value(true)
                .help("Seconds between snapshot persists"),
        )
        .arg(
            Arg::with_name("store-file")
                .short("f")
                .long("store-file")
                .takes_value(true)
                .help("Snapshot file path; empty disables persistence"),
        )
        .arg(
            Arg::with_name("store-tmp-dir")
                .long("store-tmp-dir")
                .takes_value(true)
                .help("Directory for snapshot temp files"),
        )
        .arg(
            Arg::with_name("restore")
                .short("r")
                .long("restore")
                .takes_value(true)
                .help("Replay the snapshot at startup (true/false)"),
        )
        .arg(
            Arg::with_name("database")
                .short("d")
                .long("database")
                .takes_value(true)
                .help("PostgreSQL DSN; selects the relational backend"),
        )
        .arg(
            Arg::with_name("key")
                .short("k")
                .long("key")
                .takes_value(true)
                .help("Shared secret for the integrity hash"),
        )
        .arg(
            Arg::with_name("crypto-key")
                .long("crypto-key")
                .takes_value(true)
                .help("PEM file with this server's private key"),
        )
        .arg(
            Arg::with_name("trusted-subnet")
                .short("t")
                .long("trusted-subnet")
                .takes_value(true)
                .help("CIDR that X-Real-IP must fall in"),
        )
        .arg(
            Arg::with_name("generate-keys")
                .long("generate-keys")
                .takes_value(true)
                .value_name("PUBLIC_PEM")
                .help("Generate a key pair and exit; private half goes to --crypto-key"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output"),
        )
        .get_matches();

    let file: ServerFile = match matches.value_of("config-file") {
        Some(path) => read_toml(path),
        None => ServerFile::default(),
    };

    let mut config = ServerConfig::default();
    config.verbose = matches.occurrences_of("verbose");
    apply_server_file(&mut config, file);
    apply_server_flags(&mut config, &matches);
    apply_server_env(&mut config);
    config
}

fn apply_server_file(config: &mut ServerConfig, file: ServerFile) {
    if let Some(v) = file.address {
        config.address = v;
    }
    if let Some(v) = file.store_interval {
        config.store_interval = v;
    }
    if let Some(v) = file.store_file {
        config.snapshot_path = non_empty_path(v);
    }
    if let Some(v) = file.store_tmp_dir {
        config.snapshot_tmp_dir = v;
    }
    if let Some(v) = file.restore {
        config.restore = v;
    }
    if file.database_dsn.is_some() {
        config.database_dsn = file.database_dsn;
    }
    if file.hash_key.is_some() {
        config.hash_key = file.hash_key;
    }
    if file.crypto_key.is_some() {
        config.private_key_path = file.crypto_key;
    }
    if file.trusted_subnet.is_some() {
        config.trusted_subnet = file.trusted_subnet;
    }
}

fn apply_server_flags(config: &mut ServerConfig, matches: &ArgMatches) {
    if let Some(v) = matches.value_of("address") {
        config.address = v.to_string();
    }
    if let Some(v) = matches.value_of("store-interval") {
        config.store_interval = v.parse().expect("store-interval must be seconds");
    }
    if let Some(v) = matches.value_of("store-file") {
        config.snapshot_path = non_empty_path(PathBuf::from(v));
    }
    if let Some(v) = matches.value_of("store-tmp-dir") {
        config.snapshot_tmp_dir = PathBuf::from(v);
    }
    if let Some(v) = matches.value_of("restore") {
        config.restore = v.parse().expect("restore must be true or false");
    }
    if let Some(v) = matches.value_of("database") {
        config.database_dsn = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("key") {
        config.hash_key = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("crypto-key") {
        config.private_key_path = Some(PathBuf::from(v));
    }
    if let Some(v) = matches.value_of("trusted-subnet") {
        config.trusted_subnet = Some(v.to_string());
    }
    if let Some(v) = matches.value_of("generate-keys") {
        config.generate_public_key_to = Some(PathBuf::from(v));
    }
}

fn apply_server_env(config: &mut ServerConfig) {
    if let Some(v) = env_str("ADDRESS") {
        config.address = v;
    }
    if let Some(v) = env_parse("STORE_INTERVAL") {
        config.store_interval = v;
    }
    if let Some(v) = env_str("FILE_STORAGE_PATH") {
        config.snapshot_path = non_empty_path(PathBuf::from(v));
    }
    if let Some(v) = env_str("FILE_STORAGE_TMP_DIR") {
        config.snapshot_tmp_dir = PathBuf::from(v);
    }
    if let Some(v) = env_parse("RESTORE") {
        config.restore = v;
    }
    if let Some(v) = env_str("DATABASE_DSN") {
        config.database_dsn = Some(v);
    }
    if let Some(v) = env_str("KEY") {
        config.hash_key = Some(v);
    }
    if let Some(v) = env_str("CRYPTO_KEY") {
        config.private_key_path = Some(PathBuf::from(v));
    }
    if let Some(v) = env_str("TRUSTED_SUBNET") {
        config.trusted_subnet = Some(v);
    }
}

fn non_empty_path(path: PathBuf) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_defaults_match_the_contract() {
        let config = AgentConfig::default();
        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.report_interval(), Duration::from_secs(10));
        assert_eq!(config.rate_limit, 10);
        assert!(config.hash_key.is_none());
        assert!(config.public_key_path.is_none());
    }

    #[test]
    fn agent_file_overrides_defaults() {
        let file: AgentFile = toml::from_str(
            r#"
            address = "collector:9090"
            poll_interval = 1
            rate_limit = 4
            hash_key = "sekret"
        "#,
        )
        .unwrap();
        let mut config = AgentConfig::default();
        apply_agent_file(&mut config, file);
        assert_eq!(config.address, "collector:9090");
        assert_eq!(config.poll_interval, 1);
        assert_eq!(config.report_interval, 10);
        assert_eq!(config.rate_limit, 4);
        assert_eq!(config.hash_key.as_deref(), Some("sekret"));
    }

    #[test]
    fn server_file_overrides_defaults() {
        let file: ServerFile = toml::from_str(
            r#"
            address = "0.0.0.0:8080"
            store_interval = 30
            store_file = "/var/lib/ingot/metrics.ndjson"
            restore = false
            database_dsn = "host=localhost user=ingot"
            trusted_subnet = "10.0.0.0/8"
        "#,
        )
        .unwrap();
        let mut config = ServerConfig::default();
        apply_server_file(&mut config, file);
        assert_eq!(config.address, "0.0.0.0:8080");
        assert_eq!(config.store_interval, 30);
        assert_eq!(
            config.snapshot_path,
            Some(PathBuf::from("/var/lib/ingot/metrics.ndjson"))
        );
        assert!(!config.restore);
        assert!(config.database_dsn.is_some());
        assert_eq!(config.trusted_subnet.as_deref(), Some("10.0.0.0/8"));
    }

    #[test]
    fn empty_store_file_disables_persistence() {
        let file: ServerFile = toml::from_str(r#"store_file = """#).unwrap();
        let mut config = ServerConfig::default();
        apply_server_file(&mut config, file);
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn env_wins_over_file() {
        let file: AgentFile = toml::from_str(r#"address = "from-file:1""#).unwrap();
        let mut config = AgentConfig::default();
        apply_agent_file(&mut config, file);
        env::set_var("ADDRESS", "from-env:2");
        apply_agent_env(&mut config);
        env::remove_var("ADDRESS");
        assert_eq!(config.address, "from-env:2");
    }
}
