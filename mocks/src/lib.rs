//! Test doubles for the Marcus coordination server.
//!
//! Entity builders plus scripted implementations of the external
//! collaborator contracts (classifier, Kanban sink, task producer), used
//! by the protocol and integration test suites.

pub mod builders;
pub mod classifier;
pub mod kanban;
pub mod producer;

pub use builders::{AgentBuilder, LeaseBuilder, TaskBuilder};
pub use classifier::ScriptedClassifier;
pub use kanban::RecordingKanban;
pub use producer::StaticProducer;
