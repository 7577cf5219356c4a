//! Local bookkeeping: subscription handlers and outstanding replies.

pub mod handlers;
pub mod replies;

pub use handlers::{Handler, HandlerRegistry, handler};
pub use replies::{ReplyCallback, ReplyRegistry};
