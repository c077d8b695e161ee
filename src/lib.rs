//! parleyd - core coordination layer of the Parley instant-messaging server.
//!
//! The transport (WebSocket, long-poll) and the push delivery backend are
//! collaborators behind narrow boundaries; this crate owns the per-topic
//! state machines, the account and credential lifecycle, the user cache and
//! the video-call signaling.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod metrics;
pub mod plugins;
pub mod presence;
pub mod push;
pub mod state;
pub mod store;
pub mod tags;
pub mod validate;
