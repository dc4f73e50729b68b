//! Event-name dispatch table over the App runtime.

pub mod dispatcher;

pub use dispatcher::{Direction, Dispatcher, Handler, HandlerOutcome, Monitor};
