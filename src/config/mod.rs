//! Configuration: runtime knobs, the INI-like file format, and typed views
//! of simulation and platform files.
//!
//! - [`runtime`]: framework settings with sentinel helpers;
//! - [`tree`]: parser and interpolation for configuration files;
//! - [`simulation`]: ports, components, time loop;
//! - [`platform`]: inventory, launcher, portal.

mod platform;
mod runtime;
mod simulation;
mod tree;

pub use platform::{InventoryOverride, PlatformConfig};
pub use runtime::RuntimeConfig;
pub use simulation::{ComponentConfig, DRIVER_PORT, INIT_PORT, SimulationConfig, TimeLoop};
pub use tree::ConfigTree;
