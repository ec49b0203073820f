//! Messaging session core: lifecycle actor, credential storage, traffic log
//! and push-channel fan-out. Knows nothing about HTTP.

pub mod auth_store;
pub mod batch;
pub mod client;
pub mod error;
pub mod event_log;
pub mod machine;
pub mod manager;
pub mod notifier;
pub mod phone;
pub mod qr;
pub mod responder;
pub mod session;
pub mod status;
pub mod summary;

#[cfg(test)]
mod test_support;

pub use auth_store::{AuthDirInfo, AuthStore, WipeOutcome, WipeStrategy, WipeTimings};
pub use batch::{BatchItem, BatchItemResult, BatchReport, BatchSender, BatchSettings};
pub use client::{ClientEvent, Connection, Connector, Credentials, MessagingClient};
pub use error::{ClientError, ResponderError, SessionError};
pub use event_log::{Direction, EventLog, EventRecord, LogPulse, LogStats, SendSource};
pub use manager::{AutoReplySettings, SessionManager};
pub use notifier::{Delivery, Notifier, Subscription};
pub use responder::{ReplyRequest, Responder};
pub use session::{
    AutoReplyPolicy, OutboundRequest, ReconnectPolicy, SessionContext, SessionHandle,
    SessionTimings, spawn_session,
};
pub use status::{Identity, MessageNotice, SessionEvent, SessionSnapshot, SessionStatus};
