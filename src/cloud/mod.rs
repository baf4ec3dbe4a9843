//! Cloud coordinator: agent registry, task routing and offline delivery.

pub mod api;
pub mod auth;
pub mod dispatch;
pub mod health;
pub mod mailbox;
pub mod notify;
pub mod registry;
pub mod router;
pub mod server;

pub use api::AdminApi;
pub use auth::{AdminToken, AgentKeyStore, admin_auth_middleware};
pub use dispatch::{Delivery, Dispatcher};
pub use health::{AgentHealthReport, FleetHealthReport, HealthConfig, HealthTracker};
pub use mailbox::{OfflineMailbox, OfflineQueueEntry};
pub use notify::{BroadcastNotifier, TaskNotification, TaskNotifier};
pub use registry::{AgentConnection, AgentRegistry, Outbound};
pub use router::{MessageRouter, RouteOutcome, RouterConfig};
pub use server::{CloudServer, CloudState, ServerOptions};
