//! Shared data model and wire format for `CourseChat` conversations.

pub mod codec;
pub mod message;
pub mod wire;
