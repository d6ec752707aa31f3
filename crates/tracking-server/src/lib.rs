//! # Tracking Server
//!
//! Serves live delivery tracking over WebSockets and runs the email and
//! export workers.
//!
//! ```text
//! viewer --ws--> /ws/track/:delivery_id --> ConnectionRegistry
//!                                               ^
//! DeliveryNotifier --publish--> pub/sub --forwarder (per delivery)
//!        |
//!        +--> email.queue / export.queue --> EventConsumer --> Mailer
//! ```
//!
//! With `REDIS_URL` set, instances share the pub/sub topics and the work
//! queues, so a viewer connected anywhere sees events raised anywhere.

pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod mail;
pub mod notifier;
pub mod runtime;
pub mod ws;

pub use app::{router, AppState};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handlers::{EmailDeliveryHandler, ExportDeliveryHandler};
pub use mail::{HttpMailer, LogMailer, Mailer, OutgoingEmail};
pub use notifier::{DamageReport, DeliveryNotifier};
pub use runtime::{serve, serve_on, Brokers, TrackingService};
