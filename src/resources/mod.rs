//! Resource management: the node inventory and the allocations carved out of it.
//!
//! - [`ResourceManager`]: first-fit allocator, node up/down, snapshots;
//! - [`UsageReport`]: optional `resource_usage` file;
//! - node and allocation value types.

mod manager;
mod node;
mod report;

pub use manager::ResourceManager;
pub use node::{Allocation, Inventory, NodeSpec, NodeStatus, NodeView, ResourceSnapshot};
pub use report::UsageReport;
