//! These models represent the objects passed around by the agent
//!
//! A conversation is an append-only sequence of [`message::Message`]s. Each
//! message carries a role, one or more content segments and an open `extra`
//! map for backend metadata (timestamps, parsed actions, return codes).
//! Providers and environments both produce messages in this format, and the
//! trajectory serializer persists them verbatim.
pub mod content;
pub mod message;
