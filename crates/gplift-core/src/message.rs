//! Messages streamed from the hub to a connected client.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Status, StepName, Substep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstepStatus {
    pub step: StepName,
    pub substep: Substep,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub stream: StreamKind,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    Status(SubstepStatus),
    Chunk(Chunk),
}

/// The receiving side is gone.
#[derive(Debug, Clone, Error)]
#[error("client stream closed: {0}")]
pub struct SendError(pub String);

/// Destination for live progress and output.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: Message) -> Result<(), SendError>;
}

impl MessageSender for mpsc::UnboundedSender<Message> {
    fn send(&self, message: Message) -> Result<(), SendError> {
        mpsc::UnboundedSender::send(self, message).map_err(|_| SendError("receiver dropped".into()))
    }
}

/// Discards every message; used when no client is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSender;

impl MessageSender for NullSender {
    fn send(&self, _message: Message) -> Result<(), SendError> {
        Ok(())
    }
}
