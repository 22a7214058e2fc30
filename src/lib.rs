pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod process_monitor;
pub mod rpc;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod utils;

pub use client::{SignalClient, Target};
pub use config::ClientConfig;
pub use error::ClientError;
pub use rpc::events::{Event, EventFilter, EventKind};
pub use session::{LinkingStatus, SessionState};
