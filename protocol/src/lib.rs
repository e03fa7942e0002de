//! Tool-call protocol for the Marcus coordination server.
//!
//! This crate turns the coordination engine into a request/response
//! surface: a role-gated [`dispatcher::ToolDispatcher`] that maps named
//! tools onto core operations, a JSONL [`conversation::ConversationLog`]
//! that records every exchange, and an [`http::HttpServer`] transport.
//! The stdio transport lives in the server binary.

pub mod conversation;
pub mod dispatcher;
pub mod http;
pub mod roles;

pub use conversation::{ConversationEntry, ConversationLog, ConversationMetadata, Direction};
pub use dispatcher::{ClientSession, ToolDispatcher, ToolRequest, DEFAULT_TOOL_DEADLINE};
pub use http::HttpServer;
