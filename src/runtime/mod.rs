//! Runtime core: the service router, the framework and its lifecycle.
//!
//! The public API of this module is [`FrameworkBuilder`], [`Framework`],
//! [`FrameworkHandle`] and the request/response types components exchange
//! with the router.
//!
//! Internal modules:
//! - [`router`]: the single task that owns all core state and serves requests;
//! - [`framework`]: phases, simulation lifecycle, signals and grace;
//! - [`builder`]: wiring of bus, sinks, resource manager and router;
//! - [`shutdown`]: termination signals and grace-bounded joins;
//! - [`message`]: [`Request`], [`Response`], [`Control`], [`RouterMsg`].

mod builder;
mod framework;
mod message;
mod router;
mod shutdown;

pub use builder::FrameworkBuilder;
pub use framework::{Framework, FrameworkHandle};
pub use message::{Control, Request, Response, RouterMsg, ServiceResult};
