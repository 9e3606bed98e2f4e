//! External capabilities for the Parley gateway.
//!
//! Tools are invoked by the tool-call orchestrator through the
//! `ToolExecutor` seam; each tool owns its own wire format and errors.

mod error;
mod registry;
mod search;
mod traits;

pub use error::{Result, ToolError};
pub use registry::ToolRegistry;
pub use search::SearchTool;
pub use traits::{Tool, ToolSpec, to_tool_definition};
