//! Session Broker WebSocket server: the thin collaborator shell that exposes `broker-core`'s
//! Session Broker over the duplex client channel described in spec §6. No job workspaces, no IM
//! integrations, no static-asset hosting — those belong to a product built on top of the broker,
//! not to the broker's transport binding.

mod web_server;

pub use web_server::{run_web_server, AppState};
