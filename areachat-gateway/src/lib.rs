//! `AreaChat` development gateway.
//!
//! A small axum server speaking the area channel protocol over WebSocket and
//! the area REST API. It keeps history in memory and is meant for local
//! development and end-to-end tests of the client.

pub mod api;
pub mod config;
pub mod gateway;
pub mod store;
