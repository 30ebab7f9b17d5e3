use crate::{LeaseId, PeerState, ServerId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(String),

    #[error("Scheduler has been shut down")]
    SchedulerShutdown,

    #[error("Server {server} is unreachable")]
    Unreachable { server: ServerId },

    #[error("Unknown server {server}")]
    UnknownServer { server: ServerId },

    #[error("Lease {lease_id} is already registered for {peer}")]
    DuplicateLease { peer: PeerState, lease_id: LeaseId },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// HTTP status used when this error reaches the REST surface.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::MalformedRequest(_) | Error::Serialization(_) => 400,
            Error::UnknownServer { .. } => 404,
            Error::DuplicateLease { .. } => 409,
            Error::Unreachable { .. } | Error::SchedulerShutdown => 503,
            Error::Config(_)
            | Error::MissingCollaborator(_)
            | Error::Io(_)
            | Error::Other(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
