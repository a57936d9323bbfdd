//! clicky-serves: HTTP gateway that executes gptscript tools and relays
//! their output to clients as server-sent event streams.

pub mod engine;
pub mod relay;
pub mod server;
