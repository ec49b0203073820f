use async_trait::async_trait;

use crate::error::ResponderError;

/// What the reply backend gets for one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub from_number: String,
    pub text: String,
    pub peer_id: String,
}

/// External service that decides the automatic reply to an inbound message.
#[async_trait]
pub trait Responder: Send + Sync {
    /// A successful reply is never empty; a missing or blank reply is an error.
    async fn get_reply(&self, request: &ReplyRequest) -> Result<String, ResponderError>;
}
