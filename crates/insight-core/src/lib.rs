//! Shared types for the insight orchestration engine: the chunk and insight
//! data model, tool and reasoning-provider contracts, stream events and the
//! error taxonomy every other crate builds on.

pub mod errors;
pub mod events;
pub mod ids;
pub mod insight;
pub mod messages;
pub mod provider;
pub mod security;
pub mod session;
pub mod thoughts;
pub mod tools;
