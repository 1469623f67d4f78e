pub mod dag;
pub mod edge;
pub mod node;

pub use dag::Dag;
pub use edge::{evaluate_condition, Edge, EdgeCondition};
pub use node::{Behavior, Node, DEFAULT_HANDLER};
