//! Per-area chat state: the message store and the logic that feeds it.

pub mod delivery;
pub mod pagination;
pub mod reconcile;
pub mod store;
pub mod typing;
