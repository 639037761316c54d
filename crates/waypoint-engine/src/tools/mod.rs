//! Built-in tools: project lookups, documentation search, and the
//! infrastructure suite that drives deployments.

pub mod docs_search;
pub mod infra;
pub mod project_lookup;

pub use docs_search::DocsSearchTool;
pub use infra::{infra_tools, HttpInfraBackend, InfraBackend};
pub use project_lookup::ProjectLookupTool;
