// ---------------------------------------------------------------------------
// handlers/: HTTP surface grouped by concern
// mod.rs re-exports every handler so routes read `handlers::*`.
// ---------------------------------------------------------------------------

// Sub-modules are pub(crate) so utoipa __path_* types are reachable from lib.rs.
pub(crate) mod mcp;
pub(crate) mod system;
pub(crate) mod tools;

pub use mcp::mcp_handler;
pub use system::{health, readiness};
pub use tools::{call_tool, list_tools};

// ── utoipa __path_* re-exports ───────────────────────────────────────────────
pub use system::{__path_health, __path_readiness};
pub use tools::{__path_call_tool, __path_list_tools};
