pub mod client;
pub mod controller;
pub mod discovery;
pub mod fetch;
pub mod protocol;
pub mod server;

pub use client::SyncClient;
pub use controller::{Controller, ModeKind};
pub use fetch::{PeerClient, SyncListReply};
pub use protocol::{NotifyMessage, Request, Response};
pub use server::{ServerState, SyncServer};
