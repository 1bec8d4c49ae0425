//! Front-ends that drive the conversation loop.
//!
//! - `console`: sequential REPL over any line reader/writer pair
//! - `gateway`: multi-conversation message router with a JSON-lines bridge

pub mod console;
pub mod gateway;

pub use console::{run_console, CONSOLE_IDENTITY};
pub use gateway::{Gateway, InboundMessage, OutboundMessage};
