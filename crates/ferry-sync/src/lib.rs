pub mod backfill;
pub mod collab;
pub mod config;
pub mod context;
pub mod error;
pub mod event_id;
pub mod logging;
pub mod portal;
pub mod registry;
pub mod threads;

mod local;
mod remote;

pub use context::{BridgeContext, SharedContext};
pub use error::{BridgeError, Result};
pub use portal::{Portal, PortalHandle};
pub use registry::PortalRegistry;
