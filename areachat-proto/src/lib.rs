//! Shared wire definitions for `AreaChat`: canonical messages, raw inbound
//! payloads, live-channel frames, and REST bodies.

pub mod api;
pub mod event;
pub mod frame;
pub mod message;
