#[macro_use]
extern crate tracing;

pub mod assoc;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod freshness;
pub mod lifecycle;
pub mod limits;
pub mod log;
pub mod normalize;
pub mod plugins;
pub mod registry;
pub mod scope;
pub mod session;
pub mod support;

pub use event::{Event, EventMeta};
pub use session::Session;
