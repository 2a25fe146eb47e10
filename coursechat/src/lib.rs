//! `CourseChat`: message stream reconciliation engine for course-platform chat.
//!
//! Merges three sources into one ordered, deduplicated list per
//! conversation: paginated history, a live change feed, and messages the
//! local user has sent but the server has not confirmed yet. The UI talks
//! to a [`session::ChatSession`] and renders the
//! [`reconcile::ConversationView`] it publishes.

pub mod config;
pub mod enrich;
pub mod error;
pub mod history;
pub mod live;
pub mod optimistic;
pub mod profile;
pub mod reconcile;
pub mod session;
pub mod transport;
