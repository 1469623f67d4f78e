//! Trellis engine: DAG traversal over budgeted, tiered memory.
//!
//! A task enters at the DAG's ENTRY node and advances one node at a time.
//! Before each node the `ContextAssembler` builds an immutable
//! `ContextPackage` from the task, project, and global memory tiers; the
//! `NodeExecutor` runs the node against it; the `Engine` records the result,
//! applies continuation and merge policy, and picks the next node until an
//! EXIT node concludes the task.

pub mod context;
pub mod executor;
pub mod graph;
pub mod handlers;
pub mod propagation;
pub mod router;
pub mod task;
pub mod tokens;

pub use context::{ContextAssembler, ContextProfile, ContextSpec, ProfileRegistry};
pub use executor::{NodeExecution, NodeExecutor};
pub use graph::{Dag, Edge, Node};
pub use handlers::HandlerRegistry;
pub use router::{Engine, FanOut};
pub use task::TaskHandle;
pub use tokens::{BpeCounter, TokenCounter, WordCounter};
