//! `AreaChat`: real-time area chat synchronization core.
//!
//! One [`conversation::AreaConversation`] per open chat view merges the live
//! channel, paged REST history and the local user's sends into a single
//! ordered, deduplicated message store.

pub mod backend;
pub mod chat;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod transport;
