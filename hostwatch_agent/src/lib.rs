//! hostwatch agent: samples per-core CPU usage and VPN peer activity, keeps a
//! crash-safe snapshot of peer handshakes, and answers an admin over a chat bot.

pub mod chat;
pub mod cli;
pub mod config;
pub mod cpu;
pub mod peers;
pub mod sampler;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod types;
