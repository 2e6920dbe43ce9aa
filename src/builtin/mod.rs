//! Built-in components.
//!
//! | Name | Role |
//! |------|------|
//! | [`HelloDriver`] | calls `init`/`step`/`finalize` on the `WORKER` port |
//! | [`HelloWorker`] | logs a greeting per step |
//! | [`GenericDriver`] | steps every non-driver port per time-loop value |
//! | [`ExecWorker`] | launches `BIN_PATH` on `NPROC` cores per step |

mod exec;
mod generic;
mod hello;

pub use exec::ExecWorker;
pub use generic::GenericDriver;
pub use hello::{HelloDriver, HelloWorker};

use crate::component::ComponentCatalog;

/// Adds the built-ins to `catalog`.
pub fn register(catalog: &mut ComponentCatalog) {
    catalog
        .register("HelloDriver", |_| Box::new(HelloDriver))
        .register("HelloWorker", |_| Box::new(HelloWorker))
        .register("GenericDriver", |_| Box::new(GenericDriver::default()))
        .register("ExecWorker", |_| Box::new(ExecWorker));
}
