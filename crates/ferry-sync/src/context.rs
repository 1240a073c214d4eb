use std::sync::Arc;

use ferry_db::Database;

use crate::collab::{Converter, Target, Upstream};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::threads::ThreadTracker;

pub type SharedContext = Arc<BridgeContext>;

/// Everything a portal needs, shared by all portals of one bridge.
pub struct BridgeContext {
    pub db: Arc<Database>,
    pub upstream: Arc<dyn Upstream>,
    pub target: Arc<dyn Target>,
    pub converter: Arc<dyn Converter>,
    pub config: BridgeConfig,
    pub threads: ThreadTracker,
}

impl BridgeContext {
    /// Fails with `BridgeError::Config` if `config` does not validate.
    pub fn new(
        db: Arc<Database>,
        upstream: Arc<dyn Upstream>,
        target: Arc<dyn Target>,
        converter: Arc<dyn Converter>,
        config: BridgeConfig,
    ) -> Result<SharedContext> {
        config.validate()?;
        Ok(Arc::new(Self {
            threads: ThreadTracker::new(db.clone()),
            db,
            upstream,
            target,
            converter,
            config,
        }))
    }
}
