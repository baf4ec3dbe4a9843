//! Agent fleet coordination.
//!
//! An agent holds one persistent, authenticated connection to the cloud
//! coordinator, admits tasks under resource and concurrency limits, and
//! reports every lifecycle transition back as an envelope. The coordinator
//! tracks live agents, applies those envelopes to durable task records and
//! parks control traffic for offline agents in a mailbox.

pub mod agent;
pub mod cli;
pub mod cloud;
pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod task;

pub use config::{AgentConfig, CloudConfig, DatabaseConfig};
pub use error::{
    AdmissionError, ConfigError, ConnectionError, DatabaseError, DispatchError, ExecutionError,
    ProtocolError, ServerError,
};
pub use protocol::{Envelope, EnvelopeType};
pub use task::{NewTask, Task, TaskStatus};
