//! # waypoint-core
//!
//! Foundation types shared by every Waypoint crate:
//!
//! - **Branded IDs**: [`ids::ConversationId`], [`ids::DeploymentId`], etc. as newtypes
//! - **Chat messages**: [`chat::ChatMessage`] with role, content, tool calls/results
//! - **Tools**: the [`tools::Tool`] trait, [`tools::ToolContext`], [`tools::ToolError`]
//! - **Providers**: [`provider::LlmProvider`] and the [`stream::StreamEvent`] contract
//! - **Client events**: [`events::ChatEvent`] frames streamed to the browser
//! - **State machines**: [`deploy`] and [`generation`] status enums with
//!   explicit transition tables
//! - **Errors**: [`errors::GatewayError`] hierarchy via `thiserror`
//!
//! Foundation crate. Depended on by all other waypoint crates.

#![deny(unsafe_code)]

pub mod chat;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod generation;
pub mod ids;
pub mod provider;
pub mod stream;
pub mod tools;
