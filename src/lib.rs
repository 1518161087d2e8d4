//! Courier: a direct-messaging core. It resolves the canonical 1:1
//! conversation between two users, appends and orders messages, tracks
//! per-recipient read state, materializes conversation summaries, and pushes
//! new messages to live subscribers over SSE.

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod store;
