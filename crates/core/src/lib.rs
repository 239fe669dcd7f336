//! # llm-router Core
//!
//! Domain types, traits, and error definitions for the llm-router gateway.
//! This crate has **zero framework dependencies** — it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The gateway speaks one internal dialect: the normalized request/response
//! shapes defined here. Provider adapters translate to and from it; the
//! router, rate limiter, and pipeline never see a provider wire format.
//! All crates depend inward on core.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod registry;
pub mod request;
pub mod response;

// Re-export key types at crate root for ergonomics
pub use error::{ErrorClass, ErrorEnvelope, GatewayError, Result};
pub use event::{EventBus, GatewayEvent};
pub use message::{ChatMessage, ResponseFormat, Role, ToolCall, ToolChoice, ToolDefinition};
pub use provider::{
    AuthScheme, Capability, Dialect, ModelRecord, PerfWindow, ProviderRecord,
};
pub use registry::{Registry, RegistrySnapshot};
pub use request::InferenceRequest;
pub use response::{
    EmbeddingResponse, FinishReason, InferenceResponse, ScoredDocument, StreamFrame, ToolCallOut,
    Usage,
};
