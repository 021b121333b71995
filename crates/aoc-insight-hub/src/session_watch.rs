use crate::{debounce::FlushTarget, hub::InsightHub, store::StoreHandle};
use aoc_core::insight_contracts::{MessageRecord, ServerEnvelope, SessionRecord, Topic, UsageRecord};
use aoc_storage::StorageError;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

pub const RECENT_SESSION_PAGE: usize = 20;
pub const MESSAGE_SLICE: usize = 50;

/// What a subscriber last saw of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectFingerprint {
    pub message_count: usize,
    pub max_message_id: Option<i64>,
    pub usage_timestamp: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SubjectFingerprint {
    pub fn of(
        session: &SessionRecord,
        messages: &[MessageRecord],
        usage: Option<&UsageRecord>,
    ) -> Self {
        Self {
            message_count: messages.len(),
            max_message_id: messages.iter().map(|message| message.id).max(),
            usage_timestamp: usage.and_then(|usage| usage.timestamp),
            updated_at: session.updated_at,
        }
    }
}

type ListFingerprint = Vec<(String, Option<DateTime<Utc>>, Option<String>, Option<String>)>;

fn list_fingerprint(sessions: &[SessionRecord]) -> ListFingerprint {
    sessions
        .iter()
        .map(|session| {
            (
                session.id.clone(),
                session.updated_at,
                session.status.clone(),
                session.title.clone(),
            )
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub watched: usize,
    pub changed: usize,
    pub skipped: usize,
    pub delivered: usize,
    pub list_sent: bool,
}

/// Turns store writes into `UPDATE_SESSION` and `UPDATE_SESSION_LIST` pushes.
pub struct SessionDispatcher {
    hub: Arc<InsightHub>,
    store: StoreHandle,
    cache: HashMap<String, SubjectFingerprint>,
    list_seen: Option<ListFingerprint>,
}

impl SessionDispatcher {
    pub fn new(hub: Arc<InsightHub>, store: StoreHandle) -> Self {
        Self {
            hub,
            store,
            cache: HashMap::new(),
            list_seen: None,
        }
    }

    pub async fn flush_once(&mut self) -> Result<FlushReport, StorageError> {
        let mut report = FlushReport::default();
        if self.hub.connection_count().await == 0 {
            self.cache.clear();
            self.list_seen = None;
            return Ok(report);
        }

        let recent = self
            .store
            .run(|store| store.recent_sessions(RECENT_SESSION_PAGE, 0))
            .await?;

        if self.hub.has_subscribers(&Topic::Sessions).await {
            let fingerprint = list_fingerprint(&recent);
            if self.list_seen.as_ref() != Some(&fingerprint) {
                let envelope = ServerEnvelope::UpdateSessionList {
                    sessions: recent.clone(),
                };
                report.delivered += self.hub.broadcast_to_topic(&Topic::Sessions, &envelope).await;
                report.list_sent = true;
                self.list_seen = Some(fingerprint);
            }
        } else {
            self.list_seen = None;
        }

        let ids: Vec<String> = recent.iter().map(|session| session.id.clone()).collect();
        let watched = self.hub.watched_sessions(&ids).await;
        self.cache.retain(|id, _| watched.contains(id));
        report.watched = watched.len();
        if watched.is_empty() {
            return Ok(report);
        }

        let query_ids = watched.clone();
        let (mut messages, mut usage) = self
            .store
            .run(move |store| {
                Ok((
                    store.messages_for_sessions(&query_ids)?,
                    store.latest_usage_for_sessions(&query_ids)?,
                ))
            })
            .await?;

        for session in recent.iter().filter(|session| watched.contains(&session.id)) {
            let mut session_messages = messages.remove(&session.id).unwrap_or_default();
            let latest_usage = usage.remove(&session.id);
            let fingerprint =
                SubjectFingerprint::of(session, &session_messages, latest_usage.as_ref());
            if self.cache.get(&session.id) == Some(&fingerprint) {
                report.skipped += 1;
                continue;
            }
            self.cache.insert(session.id.clone(), fingerprint);

            let keep_from = session_messages.len().saturating_sub(MESSAGE_SLICE);
            let data = session_messages.split_off(keep_from);
            let envelope = ServerEnvelope::UpdateSession {
                session_id: session.id.clone(),
                data,
                usage: latest_usage,
            };
            report.changed += 1;
            report.delivered += self
                .hub
                .broadcast_to_topic(&Topic::session(session.id.as_str()), &envelope)
                .await;
        }
        Ok(report)
    }
}

impl FlushTarget for SessionDispatcher {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn flush(&mut self) {
        match self.flush_once().await {
            Ok(report) => debug!(
                event = "store_flush",
                watched = report.watched,
                changed = report.changed,
                skipped = report.skipped,
                delivered = report.delivered,
                list_sent = report.list_sent,
                cached = self.cache.len()
            ),
            Err(err) => warn!(
                event = "store_flush_error",
                db = %self.store.path().display(),
                error = %err
            ),
        }
    }
}
