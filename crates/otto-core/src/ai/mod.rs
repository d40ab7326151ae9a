//! Backend communication: wire types, HTTP client, retry policy.

pub mod client;
pub mod retry;
pub mod types;
