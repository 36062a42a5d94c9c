//! Goal decomposition input and run bookkeeping.
//!
//! Plans are TOML files listing a goal and its tasks; templates expand a
//! goal into a plan for common workflows.

pub mod plan;
pub mod templates;
mod types;

pub use plan::{Plan, PlanTask};
pub use templates::Template;
pub use types::{RunId, RunStatus};
