//! In-memory runtime state: identifiers, access algebra, sessions, the user
//! cache, topic actors and the hub that coordinates them.

pub mod access;
pub mod cache;
pub mod hub;
pub mod session;
pub mod switchboard;
pub mod topic;
pub mod uid;

pub use access::{AccessMode, DefaultAccess};
pub use cache::UserCache;
pub use hub::Hub;
pub use session::{Session, SessionStore};
pub use switchboard::Switchboard;
pub use uid::{TopicCat, Uid, UidGenerator};
