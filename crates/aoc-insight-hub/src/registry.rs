use aoc_core::insight_contracts::Topic;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Connection to topic index kept in both directions.
///
/// The registry only knows connection ids. Channels and their lifecycle
/// belong to the hub.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_conn: HashMap<String, BTreeSet<Topic>>,
    by_topic: HashMap<Topic, HashSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a freshly opened connection with no topics.
    pub fn register(&mut self, conn_id: &str) {
        self.by_conn.entry(conn_id.to_string()).or_default();
    }

    /// Returns `true` when the membership was added by this call.
    pub fn subscribe(&mut self, conn_id: &str, topic: Topic) -> bool {
        let added = self
            .by_conn
            .entry(conn_id.to_string())
            .or_default()
            .insert(topic.clone());
        if added {
            self.by_topic
                .entry(topic)
                .or_default()
                .insert(conn_id.to_string());
        }
        added
    }

    /// Returns `true` when a membership was removed. Unknown pairs are a no-op.
    pub fn unsubscribe(&mut self, conn_id: &str, topic: &Topic) -> bool {
        let removed = self
            .by_conn
            .get_mut(conn_id)
            .map(|topics| topics.remove(topic))
            .unwrap_or(false);
        if removed {
            self.detach(conn_id, topic);
        }
        removed
    }

    /// Drops a connection from every topic it belonged to.
    pub fn forget(&mut self, conn_id: &str) -> Vec<Topic> {
        let Some(topics) = self.by_conn.remove(conn_id) else {
            return Vec::new();
        };
        for topic in &topics {
            self.detach(conn_id, topic);
        }
        topics.into_iter().collect()
    }

    pub fn subscribers_of(&self, topic: &Topic) -> Vec<String> {
        self.by_topic
            .get(topic)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, topic: &Topic) -> bool {
        self.by_topic.contains_key(topic)
    }

    pub fn topics_of(&self, conn_id: &str) -> Option<&BTreeSet<Topic>> {
        self.by_conn.get(conn_id)
    }

    fn detach(&mut self, conn_id: &str, topic: &Topic) {
        if let Some(members) = self.by_topic.get_mut(topic) {
            members.remove(conn_id);
            if members.is_empty() {
                self.by_topic.remove(topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_twice_then_unsubscribe_once_leaves_no_membership() {
        let mut registry = SubscriptionRegistry::new();
        let topic = Topic::session("s1");

        assert!(registry.subscribe("conn-1", topic.clone()));
        assert!(!registry.subscribe("conn-1", topic.clone()));
        assert!(registry.unsubscribe("conn-1", &topic));

        assert!(!registry.has_subscribers(&topic));
        assert!(registry.subscribers_of(&topic).is_empty());
        assert!(registry
            .topics_of("conn-1")
            .expect("connection stays registered")
            .is_empty());
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(!registry.unsubscribe("conn-9", &Topic::Logs));

        registry.register("conn-1");
        assert!(!registry.unsubscribe("conn-1", &Topic::Logs));
        assert!(registry.by_topic.is_empty());
    }

    #[test]
    fn empty_topics_are_pruned_immediately() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("conn-1", Topic::Logs);
        registry.subscribe("conn-2", Topic::Logs);
        assert_eq!(registry.by_topic.len(), 1);

        registry.unsubscribe("conn-1", &Topic::Logs);
        assert!(registry.has_subscribers(&Topic::Logs));
        registry.unsubscribe("conn-2", &Topic::Logs);
        assert!(!registry.has_subscribers(&Topic::Logs));
        assert!(registry.by_topic.is_empty());
    }

    #[test]
    fn forget_removes_connection_from_every_topic() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("conn-1", Topic::Logs);
        registry.subscribe("conn-1", Topic::session("a"));
        registry.subscribe("conn-2", Topic::session("a"));

        let mut dropped = registry.forget("conn-1");
        dropped.sort();
        assert_eq!(dropped, vec![Topic::Logs, Topic::session("a")]);
        assert!(!registry.has_subscribers(&Topic::Logs));
        assert_eq!(
            registry.subscribers_of(&Topic::session("a")),
            vec!["conn-2".to_string()]
        );
        assert!(registry.topics_of("conn-1").is_none());
        assert!(registry.forget("conn-1").is_empty());
    }
}
