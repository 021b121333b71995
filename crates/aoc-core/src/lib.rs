pub mod insight_contracts;
pub mod sql_guard;

pub use insight_contracts::{
    parse_client_frame, ClientFrame, MessageRecord, ServerEnvelope, SessionRecord, Topic,
    UsageRecord,
};
pub use sql_guard::{guard_readonly_query, GuardError, QueryGuard};
