//! Persistence layer modules.

pub mod session_store;
