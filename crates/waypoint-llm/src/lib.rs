//! Model providers for waypoint: an OpenAI-compatible streaming gateway and
//! a deterministic mock for tests.

pub mod gateway;
pub mod mock;
pub mod sse;

pub use gateway::OpenAiGateway;
pub use mock::{MockProvider, MockResponse};
