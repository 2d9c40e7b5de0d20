//! Message pipeline — drains the store for a group, runs the agent
//! container, and streams the reply back through the owning transport.

pub mod processor;
pub mod prompt;

pub use processor::MessagePipeline;
