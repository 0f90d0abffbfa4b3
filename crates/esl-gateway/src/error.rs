use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures handing a frame to an AP session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("unknown ap {store}/{ap_id}")]
    UnknownAp { store: String, ap_id: String },
    #[error("ap {0} is offline")]
    Offline(String),
    #[error("ap {0} is busy")]
    Busy(String),
    #[error("ap {0} is faulted")]
    Faulted(String),
    #[error("session {0} closed")]
    SessionClosed(String),
    #[error("session {0} outbound queue full")]
    ChannelFull(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("config read {path} failed: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config parse failed: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("gateway already running on {0}")]
    AlreadyRunning(String),
    #[error("gateway has been shut down")]
    Stopped,
}

/// Result code returned by every caller-facing gateway operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    InvalidTagId,
    InvalidStoreCode,
    InvalidApId,
    InvalidTaskData,
    InvalidImage,
    NullData,
    Error,
    NoTaskCreate,
    NotAllTaskCreate,
    NoApOnline,
    NoApIdle,
    ApBusy,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::InvalidTagId => "invalid_tag_id",
            Outcome::InvalidStoreCode => "invalid_store_code",
            Outcome::InvalidApId => "invalid_ap_id",
            Outcome::InvalidTaskData => "invalid_task_data",
            Outcome::InvalidImage => "invalid_image",
            Outcome::NullData => "null_data",
            Outcome::Error => "error",
            Outcome::NoTaskCreate => "no_task_create",
            Outcome::NotAllTaskCreate => "not_all_task_create",
            Outcome::NoApOnline => "no_ap_online",
            Outcome::NoApIdle => "no_ap_idle",
            Outcome::ApBusy => "ap_busy",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
