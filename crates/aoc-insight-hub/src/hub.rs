use crate::registry::SubscriptionRegistry;
use aoc_core::insight_contracts::{InitItem, PluginDescriptor, ServerEnvelope, Topic};
use axum::extract::ws::Message;
use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub workspace: String,
    pub plugins: Vec<PluginDescriptor>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            workspace: String::new(),
            plugins: Vec::new(),
        }
    }
}

pub struct Client {
    pub conn_id: String,
    sender: mpsc::Sender<Message>,
    evicted: watch::Sender<bool>,
}

impl Client {
    fn deliver(&self, text: &str) -> Result<(), &'static str> {
        match self.sender.try_send(Message::Text(text.to_string())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err("closed"),
            Err(mpsc::error::TrySendError::Full(_)) => Err("backpressure"),
        }
    }
}

/// Live connections plus their topic memberships.
pub struct InsightHub {
    config: HubConfig,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    registry: RwLock<SubscriptionRegistry>,
}

impl InsightHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            registry: RwLock::new(SubscriptionRegistry::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    /// Adds a connection with an empty topic set. The receiver flips to `true`
    /// once the hub has evicted the connection.
    pub async fn register(
        &self,
        sender: mpsc::Sender<Message>,
    ) -> (Arc<Client>, watch::Receiver<bool>) {
        let (evicted, evicted_rx) = watch::channel(false);
        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            sender,
            evicted,
        });
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        self.registry.write().await.register(&client.conn_id);
        info!(event = "client_connected", conn_id = %client.conn_id);
        (client, evicted_rx)
    }

    pub async fn unregister(&self, conn_id: &str, reason: &str) {
        let removed = self.clients.write().await.remove(conn_id);
        let topics = self.registry.write().await.forget(conn_id);
        if let Some(client) = removed {
            client.evicted.send_replace(true);
            info!(
                event = "client_disconnected",
                conn_id = %conn_id,
                topics = topics.len(),
                reason = reason
            );
        }
    }

    pub async fn subscribe(&self, conn_id: &str, topic: Topic) -> bool {
        if !self.clients.read().await.contains_key(conn_id) {
            return false;
        }
        let label = topic.to_string();
        let added = self.registry.write().await.subscribe(conn_id, topic);
        debug!(event = "subscribe", conn_id = %conn_id, topic = %label, added = added);
        added
    }

    pub async fn unsubscribe(&self, conn_id: &str, topic: &Topic) -> bool {
        let removed = self.registry.write().await.unsubscribe(conn_id, topic);
        debug!(event = "unsubscribe", conn_id = %conn_id, topic = %topic, removed = removed);
        removed
    }

    pub async fn has_subscribers(&self, topic: &Topic) -> bool {
        self.registry.read().await.has_subscribers(topic)
    }

    /// Keeps the session ids whose `session:<id>` topic has members, preserving order.
    pub async fn watched_sessions(&self, session_ids: &[String]) -> Vec<String> {
        let registry = self.registry.read().await;
        session_ids
            .iter()
            .filter(|id| registry.has_subscribers(&Topic::session(id.as_str())))
            .cloned()
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub fn init_envelope(&self) -> ServerEnvelope {
        let mut payload = Vec::with_capacity(self.config.plugins.len() + 1);
        payload.push(InitItem::Workspace {
            workspace_path: self.config.workspace.clone(),
        });
        payload.extend(self.config.plugins.iter().map(InitItem::from));
        ServerEnvelope::Init { payload }
    }

    /// Writes one envelope to one connection; a failed write evicts it.
    pub async fn send_to(&self, conn_id: &str, envelope: &ServerEnvelope) -> bool {
        let Some(text) = encode(envelope) else {
            return false;
        };
        let client = self.clients.read().await.get(conn_id).cloned();
        let Some(client) = client else {
            return false;
        };
        match client.deliver(&text) {
            Ok(()) => true,
            Err(reason) => {
                warn!(event = "send_error", conn_id = %conn_id, kind = envelope.kind(), reason = reason);
                self.unregister(conn_id, reason).await;
                false
            }
        }
    }

    /// Sends to every live connection whose topic set satisfies `predicate`.
    pub async fn broadcast<P>(&self, envelope: &ServerEnvelope, predicate: P) -> usize
    where
        P: Fn(&BTreeSet<Topic>) -> bool,
    {
        let targets: Vec<Arc<Client>> = {
            let clients = self.clients.read().await;
            let registry = self.registry.read().await;
            clients
                .values()
                .filter(|client| {
                    registry
                        .topics_of(&client.conn_id)
                        .map(|topics| predicate(topics))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        self.deliver_all(envelope, targets).await
    }

    /// Sends only to the members of `topic`.
    pub async fn broadcast_to_topic(&self, topic: &Topic, envelope: &ServerEnvelope) -> usize {
        let members = self.registry.read().await.subscribers_of(topic);
        if members.is_empty() {
            return 0;
        }
        let targets: Vec<Arc<Client>> = {
            let clients = self.clients.read().await;
            members
                .iter()
                .filter_map(|conn_id| clients.get(conn_id).cloned())
                .collect()
        };
        self.deliver_all(envelope, targets).await
    }

    async fn deliver_all(&self, envelope: &ServerEnvelope, targets: Vec<Arc<Client>>) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let Some(text) = encode(envelope) else {
            return 0;
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        for client in targets {
            match client.deliver(&text) {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    warn!(event = "send_error", conn_id = %client.conn_id, kind = envelope.kind(), reason = reason);
                    dead.push((client.conn_id.clone(), reason));
                }
            }
        }
        for (conn_id, reason) in dead {
            self.unregister(&conn_id, reason).await;
        }
        delivered
    }
}

fn encode(envelope: &ServerEnvelope) -> Option<String> {
    match envelope.to_json() {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(event = "encode_error", kind = envelope.kind(), error = %err);
            None
        }
    }
}

/// Workspace identity advertised in INIT: the full path only when opted in.
pub fn workspace_identity(path: &Path, expose_full_path: bool) -> String {
    if expose_full_path {
        return path.display().to_string();
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_core::insight_contracts::builtin_plugins;
    use std::path::PathBuf;

    fn text_of(message: Message) -> String {
        match message {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn log_line(line: &str) -> ServerEnvelope {
        ServerEnvelope::AgentLog {
            log: line.to_string(),
        }
    }

    #[tokio::test]
    async fn topic_broadcast_reaches_members_only() {
        let hub = InsightHub::new(HubConfig::default());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (a, _) = hub.register(tx_a).await;
        let (_b, _) = hub.register(tx_b).await;

        assert!(hub.subscribe(&a.conn_id, Topic::Logs).await);
        let delivered = hub.broadcast_to_topic(&Topic::Logs, &log_line("one")).await;

        assert_eq!(delivered, 1);
        assert_eq!(
            text_of(rx_a.recv().await.expect("frame")),
            r#"{"type":"AGENT_LOG","log":"one"}"#
        );
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted_on_send() {
        let hub = InsightHub::new(HubConfig::default());
        let (tx, rx) = mpsc::channel(8);
        let (client, mut evicted) = hub.register(tx).await;
        hub.subscribe(&client.conn_id, Topic::Logs).await;
        drop(rx);

        let delivered = hub.broadcast_to_topic(&Topic::Logs, &log_line("lost")).await;

        assert_eq!(delivered, 0);
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.has_subscribers(&Topic::Logs).await);
        assert!(*evicted.borrow_and_update());
    }

    #[tokio::test]
    async fn full_queue_counts_as_failed_write() {
        let hub = InsightHub::new(HubConfig::default());
        let (tx, _rx) = mpsc::channel(1);
        let (client, _) = hub.register(tx).await;

        assert!(hub.send_to(&client.conn_id, &log_line("first")).await);
        assert!(!hub.send_to(&client.conn_id, &log_line("second")).await);
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.send_to(&client.conn_id, &log_line("third")).await);
    }

    #[tokio::test]
    async fn predicate_broadcast_filters_on_topic_sets() {
        let hub = InsightHub::new(HubConfig::default());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (a, _) = hub.register(tx_a).await;
        let (b, _) = hub.register(tx_b).await;
        hub.subscribe(&a.conn_id, Topic::session("s1")).await;
        hub.subscribe(&b.conn_id, Topic::Logs).await;

        let everyone = hub.broadcast(&log_line("all"), |_| true).await;
        assert_eq!(everyone, 2);
        let session_watchers = hub
            .broadcast(&log_line("some"), |topics| {
                topics.iter().any(|topic| matches!(topic, Topic::Session(_)))
            })
            .await;
        assert_eq!(session_watchers, 1);

        assert!(text_of(rx_a.recv().await.expect("a1")).contains("all"));
        assert!(text_of(rx_a.recv().await.expect("a2")).contains("some"));
        assert!(text_of(rx_b.recv().await.expect("b1")).contains("all"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn watched_sessions_keeps_only_subscribed_ids() {
        let hub = InsightHub::new(HubConfig::default());
        let (tx, _rx) = mpsc::channel(8);
        let (client, _) = hub.register(tx).await;
        hub.subscribe(&client.conn_id, Topic::session("b")).await;

        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(hub.watched_sessions(&ids).await, vec!["b".to_string()]);

        hub.unregister(&client.conn_id, "test").await;
        assert!(hub.watched_sessions(&ids).await.is_empty());
        assert!(!hub.subscribe(&client.conn_id, Topic::Logs).await);
    }

    #[test]
    fn init_advertises_workspace_then_plugins() {
        let hub = InsightHub::new(HubConfig {
            workspace: "project".to_string(),
            plugins: builtin_plugins(),
            ..HubConfig::default()
        });
        let ServerEnvelope::Init { payload } = hub.init_envelope() else {
            panic!("expected INIT");
        };
        assert_eq!(payload.len(), 5);
        assert_eq!(
            payload[0],
            InitItem::Workspace {
                workspace_path: "project".to_string()
            }
        );
    }

    #[test]
    fn workspace_identity_hides_full_path_by_default() {
        let path = PathBuf::from("/home/dev/projects/cockpit");
        assert_eq!(workspace_identity(&path, false), "cockpit");
        assert_eq!(
            workspace_identity(&path, true),
            "/home/dev/projects/cockpit"
        );
    }
}
