pub mod condition;
pub mod template;

pub use condition::{evaluate_condition, ConditionError};
pub use template::{resolve_map, resolve_path, resolve_value, OutputsTable, ResolverError};
