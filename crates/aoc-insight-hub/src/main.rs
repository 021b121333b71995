mod api;
mod connection;
mod debounce;
mod hub;
mod log_watch;
mod registry;
mod session_watch;
mod store;

use crate::{
    api::AppState,
    debounce::{run_dispatcher, spawn_watcher, WatchTarget},
    hub::{workspace_identity, HubConfig, InsightHub},
    log_watch::{LogDispatcher, LogTail},
    session_watch::SessionDispatcher,
    store::StoreHandle,
};
use aoc_core::{
    insight_contracts::{builtin_plugins, PluginDescriptor},
    QueryGuard,
};
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:3001";
const DEFAULT_DB: &str = "opencode.db";
const DEFAULT_AGENT_LOG: &str = ".aoc/logs/agent.log";
const DEFAULT_LOG_DIR: &str = ".aoc/logs";
const QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    allow_remote: bool,
    db_path: PathBuf,
    agent_log: PathBuf,
    workspace: PathBuf,
    expose_workspace_path: bool,
    disabled_plugins: Vec<String>,
    store_debounce: Duration,
    log_debounce: Duration,
    write_timeout: Duration,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "aoc-insight-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    agent_log: String,
    #[arg(long, default_value = "")]
    workspace: String,
    #[arg(long, default_value_t = false)]
    expose_workspace_path: bool,
    #[arg(long = "disable-plugin")]
    disable_plugin: Vec<String>,
    #[arg(long, default_value_t = 200)]
    store_debounce_ms: u64,
    #[arg(long, default_value_t = 50)]
    log_debounce_ms: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() && !config.allow_remote {
        error!(event = "invalid_addr", addr = %config.addr, reason = "non-loopback address requires --allow-remote");
        return;
    }

    let hub = Arc::new(InsightHub::new(hub_config(&config)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    start_dispatchers(&config, hub.clone(), shutdown_rx);

    let app = api::router(AppState {
        hub: hub.clone(),
        store: StoreHandle::new(&config.db_path),
        guard: QueryGuard::default(),
        started: Instant::now(),
        allow_remote: config.allow_remote,
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "insight_error", error = %err);
            return;
        }
    };

    info!(
        event = "insight_start",
        addr = %config.addr,
        db = %config.db_path.display(),
        agent_log = %config.agent_log.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "insight_error", error = %err);
    }
    let _ = shutdown_tx.send(true);
    info!(event = "insight_stop");
}

fn hub_config(config: &Config) -> HubConfig {
    HubConfig {
        write_timeout: config.write_timeout,
        queue_capacity: QUEUE_CAPACITY,
        workspace: workspace_identity(&config.workspace, config.expose_workspace_path),
        plugins: enabled_plugins(&config.disabled_plugins),
    }
}

/// Wires the store and log watchers to their dispatchers.
fn start_dispatchers(config: &Config, hub: Arc<InsightHub>, shutdown: watch::Receiver<bool>) {
    let (store_tx, store_rx) = mpsc::unbounded_channel();
    spawn_watcher(
        WatchTarget::for_file(&config.db_path, true),
        store_tx,
        shutdown.clone(),
    );
    tokio::spawn(run_dispatcher(
        SessionDispatcher::new(hub.clone(), StoreHandle::new(&config.db_path)),
        config.store_debounce,
        store_rx,
        shutdown.clone(),
    ));

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let mut tail = LogTail::new(&config.agent_log);
    let log_debounce = config.log_debounce;
    let log_shutdown = shutdown.clone();
    tokio::spawn(async move {
        tail.prime().await;
        run_dispatcher(LogDispatcher::new(hub, tail), log_debounce, log_rx, log_shutdown).await;
    });
    spawn_watcher(WatchTarget::for_file(&config.agent_log, false), log_tx, shutdown);
}

fn enabled_plugins(disabled: &[String]) -> Vec<PluginDescriptor> {
    builtin_plugins()
        .into_iter()
        .filter(|plugin| !disabled.iter().any(|id| id == &plugin.id))
        .collect()
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("AOC_INSIGHT_DEBUG");
    let mut disabled_plugins = args.disable_plugin.clone();
    disabled_plugins.extend(split_list(
        &std::env::var("AOC_INSIGHT_DISABLED_PLUGINS").unwrap_or_default(),
    ));
    Config {
        addr: resolve_setting(&args.addr, &["AOC_INSIGHT_ADDR"], DEFAULT_ADDR),
        allow_remote: args.allow_remote,
        db_path: PathBuf::from(resolve_setting(
            &args.db,
            &["AOC_INSIGHT_DB", "DB_PATH"],
            DEFAULT_DB,
        )),
        agent_log: PathBuf::from(resolve_setting(
            &args.agent_log,
            &["AOC_INSIGHT_AGENT_LOG"],
            DEFAULT_AGENT_LOG,
        )),
        workspace: resolve_workspace(&args.workspace),
        expose_workspace_path: args.expose_workspace_path
            || env_true("AOC_INSIGHT_EXPOSE_WORKSPACE_PATH"),
        disabled_plugins,
        store_debounce: Duration::from_millis(args.store_debounce_ms),
        log_debounce: Duration::from_millis(args.log_debounce_ms),
        write_timeout: Duration::from_secs(args.write_timeout),
        debug,
        log_dir: resolve_setting(&args.log_dir, &["AOC_LOG_DIR"], DEFAULT_LOG_DIR),
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("AOC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &log_file_tag(&config.addr)) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, tag: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("aoc-insight-{tag}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

/// Port of the listen address, or the whole address when it has none.
fn log_file_tag(addr: &str) -> String {
    match addr.parse::<SocketAddr>() {
        Ok(parsed) => parsed.port().to_string(),
        Err(_) => addr.replace([':', '/', '\\'], "_"),
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => is_truthy(&value),
        Err(_) => false,
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Flag if set, then the first non-empty env var, then the default.
fn resolve_setting(flag: &str, env_keys: &[&str], default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    for key in env_keys {
        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    default.to_string()
}

fn resolve_workspace(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_core::insight_contracts::Topic;
    use aoc_storage::SESSION_SCHEMA_SQL;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
    };

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config(dir: &Path) -> Config {
        Config {
            addr: "127.0.0.1:0".to_string(),
            allow_remote: false,
            db_path: dir.join("opencode.db"),
            agent_log: dir.join("agent.log"),
            workspace: PathBuf::from("/home/dev/secret/project"),
            expose_workspace_path: false,
            disabled_plugins: vec!["settings-viewer".to_string()],
            store_debounce: Duration::from_millis(50),
            log_debounce: Duration::from_millis(20),
            write_timeout: Duration::from_secs(2),
            debug: false,
            log_dir: String::new(),
        }
    }

    async fn serve(config: &Config) -> (SocketAddr, Arc<InsightHub>, watch::Sender<bool>) {
        let hub = Arc::new(InsightHub::new(hub_config(config)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        start_dispatchers(config, hub.clone(), shutdown_rx);
        let app = api::router(AppState {
            hub: hub.clone(),
            store: StoreHandle::new(&config.db_path),
            guard: QueryGuard::default(),
            started: Instant::now(),
            allow_remote: false,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        (addr, hub, shutdown_tx)
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), client.next())
                .await
                .expect("frame before timeout")
                .expect("stream open")
                .expect("frame");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).expect("json frame");
            }
        }
    }

    async fn wait_for_subscriber(hub: &InsightHub, topic: &Topic) {
        for _ in 0..200 {
            if hub.has_subscribers(topic).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no subscriber for {topic}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn observer_gets_init_and_subscribed_log_lines() {
        let dir = tempdir().expect("temp dir");
        let config = test_config(dir.path());
        std::fs::write(&config.agent_log, "history that is never replayed\n").expect("seed log");
        let (addr, hub, shutdown) = serve(&config).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        let init = next_json(&mut client).await;
        assert_eq!(init["type"], "INIT");
        assert_eq!(init["payload"][0]["workspacePath"], "project");
        let plugin_ids: Vec<&str> = init["payload"]
            .as_array()
            .expect("payload")
            .iter()
            .filter_map(|item| item["id"].as_str())
            .collect();
        assert_eq!(plugin_ids, vec!["session-viewer", "agent-monitor", "raw-data-viewer"]);

        client
            .send(WsMessage::Text("not a frame".to_string()))
            .await
            .expect("send garbage");
        client
            .send(WsMessage::Text(r#"{"type":"SUBSCRIBE","topic":"logs"}"#.to_string()))
            .await
            .expect("subscribe");
        wait_for_subscriber(&hub, &Topic::Logs).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut log = OpenOptions::new()
            .append(true)
            .open(&config.agent_log)
            .expect("open log");
        log.write_all(b"tool: bash\n").expect("append");
        log.flush().expect("flush");

        let line = next_json(&mut client).await;
        assert_eq!(line["type"], "AGENT_LOG");
        assert_eq!(line["log"], "tool: bash");

        client.close(None).await.expect("close");
        for _ in 0..200 {
            if hub.connection_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.has_subscribers(&Topic::Logs).await);
        let _ = shutdown.send(true);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_write_reaches_session_subscriber() {
        let dir = tempdir().expect("temp dir");
        let config = test_config(dir.path());
        let writer = rusqlite::Connection::open(&config.db_path).expect("writer");
        writer.execute_batch(SESSION_SCHEMA_SQL).expect("schema");
        writer
            .execute(
                "INSERT INTO session (id, title, updated_at) VALUES ('s1', 'demo', 100)",
                [],
            )
            .expect("session");
        let (addr, hub, shutdown) = serve(&config).await;

        let (mut client, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        assert_eq!(next_json(&mut client).await["type"], "INIT");
        client
            .send(WsMessage::Text(r#"{"type":"SUBSCRIBE","topic":"session:s1"}"#.to_string()))
            .await
            .expect("subscribe");
        wait_for_subscriber(&hub, &Topic::session("s1")).await;

        writer
            .execute(
                "INSERT INTO message (session_id, role, content, timestamp) VALUES ('s1', 'user', 'hello', 110)",
                [],
            )
            .expect("message");

        let update = loop {
            let frame = next_json(&mut client).await;
            if frame["data"].as_array().map(|data| !data.is_empty()).unwrap_or(false) {
                break frame;
            }
        };
        assert_eq!(update["type"], "UPDATE_SESSION");
        assert_eq!(update["sessionId"], "s1");
        assert_eq!(update["data"][0]["content"], "hello");
        let _ = shutdown.send(true);
    }

    #[test]
    fn settings_resolve_flag_then_env_then_default() {
        assert_eq!(
            resolve_setting("127.0.0.1:9000", &["AOC_INSIGHT_TEST_UNSET_ADDR"], DEFAULT_ADDR),
            "127.0.0.1:9000"
        );
        assert_eq!(
            resolve_setting("  ", &["AOC_INSIGHT_TEST_UNSET_ADDR"], DEFAULT_ADDR),
            DEFAULT_ADDR
        );
        std::env::set_var("AOC_INSIGHT_TEST_DB_PATH", "/tmp/agent.db");
        assert_eq!(
            resolve_setting("", &["AOC_INSIGHT_TEST_UNSET_DB", "AOC_INSIGHT_TEST_DB_PATH"], DEFAULT_DB),
            "/tmp/agent.db"
        );
        std::env::remove_var("AOC_INSIGHT_TEST_DB_PATH");
    }

    #[test]
    fn truthy_values_and_plugin_filtering() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));

        let disabled = split_list(" raw-data-viewer, ,agent-monitor");
        let ids: Vec<String> = enabled_plugins(&disabled)
            .into_iter()
            .map(|plugin| plugin.id)
            .collect();
        assert_eq!(ids, vec!["session-viewer", "settings-viewer"]);
    }

    #[test]
    fn log_file_is_tagged_by_port() {
        assert_eq!(log_file_tag("127.0.0.1:3001"), "3001");
        assert_eq!(log_file_tag("localhost"), "localhost");
    }
}
