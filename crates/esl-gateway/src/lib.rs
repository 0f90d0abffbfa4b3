//! TCP middleware between store systems and ESL access points.

pub mod config;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod model;
pub mod scheduler;
pub mod session;
pub mod tagx;
mod throttle;

pub use config::{GatewayConfig, IdleTimeoutPolicy, RetryCeilingPolicy};
pub use error::{GatewayError, Outcome, SendError};
pub use gateway::Gateway;
pub use model::{
    Ap, ApStatus, ApStatusEvent, ServerInfo, Tag, TagStatus, TaskData, TaskResult,
    TaskResultBatch, TaskStatus,
};
pub use session::{SessionSnapshot, SessionState};
