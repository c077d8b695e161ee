//! Client-request handlers.
//!
//! The transport decodes a client message and dispatches it here: account
//! messages to `account`, topic messages to the owning topic actor through
//! the hub. Handlers reply by queueing ctrl messages on the session.

pub mod account;
