//! # agent-mesh
//!
//! Runtime for composing agents, tools and model endpoints into
//! request-driven execution graphs.
//!
//! This library provides:
//! - A lifecycle engine that runs every node invocation under the same
//!   permission, concurrency, timeout, retry and cancellation rules
//! - ReAct, parallel-dispatch, chat and workflow agents
//! - Native tools, tool collections and remote tool servers
//! - Streaming events and an HTTP API
//!
//! ## Architecture
//!
//! ```text
//!   POST /api/chat ──► Mesh::chat ──► Mesh::invoke(master)
//!                                        │
//!                                        ▼
//!                              ┌──────────────────┐
//!                              │   ReActAgent     │
//!                              └───┬─────────┬────┘
//!                  Mesh::call      │         │   Mesh::call_parallel
//!                                  ▼         ▼
//!                            ┌─────────┐ ┌─────────┐
//!                            │ LlmNode │ │  tools  │
//!                            └─────────┘ └─────────┘
//! ```
//!
//! ## Modules
//! - `engine`: `Mesh`, the lifecycle engine and error taxonomy
//! - `envelope`: request/response envelopes and call stacks
//! - `node`: the `Node` trait and per-node configuration
//! - `registry`: node table, permission resolution, `MeshBuilder`
//! - `agents`: ReAct, parallel, chat and workflow agents
//! - `memory`: dialogue memory, weighted selection, history store
//! - `llm`: model clients and the model node
//! - `tools` / `mcp`: native and remote tools
//! - `events` / `api`: outbound notifications and the HTTP surface

pub mod agents;
pub mod api;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod node;
pub mod registry;
pub mod tools;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{ChatPayload, Mesh, NodeError};
pub use envelope::{NodeState, Request, Response};
pub use node::{Node, NodeConfig};
pub use registry::MeshBuilder;
