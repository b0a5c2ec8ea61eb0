//! Data models for chat rooms and notifications

mod message;
mod notification;

pub use message::*;
pub use notification::*;
