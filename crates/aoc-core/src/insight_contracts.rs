use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TOPIC_LOGS: &str = "logs";
pub const TOPIC_SESSIONS: &str = "sessions";
pub const SESSION_TOPIC_PREFIX: &str = "session:";
pub const MAX_SUBJECT_ID_LEN: usize = 128;

/// Interest stream a connection can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Agent log lines.
    Logs,
    /// The recent session list.
    Sessions,
    /// Updates for one session.
    Session(String),
}

impl Topic {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self::Session(session_id.into())
    }

    /// Validates a topic string received from a peer.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            TOPIC_LOGS => Some(Self::Logs),
            TOPIC_SESSIONS => Some(Self::Sessions),
            other => {
                let id = other.strip_prefix(SESSION_TOPIC_PREFIX)?;
                is_valid_subject_id(id).then(|| Self::Session(id.to_string()))
            }
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Logs => f.write_str(TOPIC_LOGS),
            Topic::Sessions => f.write_str(TOPIC_SESSIONS),
            Topic::Session(id) => write!(f, "{SESSION_TOPIC_PREFIX}{id}"),
        }
    }
}

pub fn is_valid_subject_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SUBJECT_ID_LEN
        && id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.'))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: i64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A session together with its messages, as served by the session detail route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionRecord,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
}

impl PluginDescriptor {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

pub fn builtin_plugins() -> Vec<PluginDescriptor> {
    vec![
        PluginDescriptor::new("session-viewer", "Sessions"),
        PluginDescriptor::new("agent-monitor", "Agent Monitor"),
        PluginDescriptor::new("settings-viewer", "Settings"),
        PluginDescriptor::new("raw-data-viewer", "Raw Data"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitItem {
    Workspace {
        #[serde(rename = "workspacePath")]
        workspace_path: String,
    },
    Plugin {
        id: String,
        name: String,
    },
}

impl From<&PluginDescriptor> for InitItem {
    fn from(plugin: &PluginDescriptor) -> Self {
        InitItem::Plugin {
            id: plugin.id.clone(),
            name: plugin.name.clone(),
        }
    }
}

/// Messages the server pushes to observers.
///
/// Consumers should ignore `type` values they do not know; new kinds get added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEnvelope {
    Init {
        payload: Vec<InitItem>,
    },
    UpdateSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: Vec<MessageRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageRecord>,
    },
    UpdateSessionList {
        sessions: Vec<SessionRecord>,
    },
    AgentLog {
        log: String,
    },
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Init { .. } => "INIT",
            ServerEnvelope::UpdateSession { .. } => "UPDATE_SESSION",
            ServerEnvelope::UpdateSessionList { .. } => "UPDATE_SESSION_LIST",
            ServerEnvelope::AgentLog { .. } => "AGENT_LOG",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum RawClientFrame {
    Subscribe {
        #[serde(alias = "payload")]
        topic: String,
    },
    Unsubscribe {
        #[serde(alias = "payload")]
        topic: String,
    },
}

/// An inbound frame after validation. Anything unusable ends up in `Dropped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Dropped(FrameRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRejection {
    Malformed(String),
    UnknownTopic(String),
}

impl fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameRejection::Malformed(reason) => write!(f, "malformed frame: {reason}"),
            FrameRejection::UnknownTopic(topic) => write!(f, "unknown topic: {topic}"),
        }
    }
}

pub fn parse_client_frame(raw: &str) -> ClientFrame {
    let frame: RawClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(err) => return ClientFrame::Dropped(FrameRejection::Malformed(err.to_string())),
    };
    let (topic, subscribe) = match frame {
        RawClientFrame::Subscribe { topic } => (topic, true),
        RawClientFrame::Unsubscribe { topic } => (topic, false),
    };
    match Topic::parse(&topic) {
        Some(topic) if subscribe => ClientFrame::Subscribe(topic),
        Some(topic) => ClientFrame::Unsubscribe(topic),
        None => ClientFrame::Dropped(FrameRejection::UnknownTopic(topic)),
    }
}
