//! The sync protocol: wire messages, transfer sessions, and the two ends
//! of an exchange.

pub mod auth;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod delta_select;
pub mod server;
pub mod session;

pub use auth::{Capabilities, UserTable};
pub use client::{sync, Credentials, SyncReport, SyncRequest};
pub use codec::Message;
pub use server::Server;
pub use session::{Session, XferStats};
