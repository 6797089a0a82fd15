/// Cache registry and its access modes.
pub mod registry;
/// Per-exercise session cache types.
pub mod session;

use std::sync::Arc;

use crate::dao::quiz_store::QuizStore;
use crate::scheduler::TaskScheduler;
use crate::services::messaging::ClientGateway;
use crate::services::statistics::StatisticsSink;
use crate::state::registry::CacheRegistry;

/// Shared handle to the wiring bundle passed into every service function.
pub type SharedContext = Arc<SessionContext>;

/// Central bundle of the collaborators the session services operate on.
///
/// Everything is injected at construction; there is no process-wide static
/// state, so tests can wire several contexts against one shared topology to
/// model a multi-node cluster.
pub struct SessionContext {
    registry: Arc<CacheRegistry>,
    scheduler: Arc<dyn TaskScheduler>,
    store: Arc<dyn QuizStore>,
    statistics: Arc<dyn StatisticsSink>,
    gateway: Arc<dyn ClientGateway>,
}

impl SessionContext {
    /// Bundle the given collaborators into a shared context.
    pub fn new(
        registry: Arc<CacheRegistry>,
        scheduler: Arc<dyn TaskScheduler>,
        store: Arc<dyn QuizStore>,
        statistics: Arc<dyn StatisticsSink>,
        gateway: Arc<dyn ClientGateway>,
    ) -> SharedContext {
        Arc::new(Self {
            registry,
            scheduler,
            store,
            statistics,
            gateway,
        })
    }

    /// The session cache registry of this node.
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// The cluster scheduling facility.
    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    /// The persistence collaborator.
    pub fn store(&self) -> &Arc<dyn QuizStore> {
        &self.store
    }

    /// The statistics aggregation collaborator.
    pub fn statistics(&self) -> &Arc<dyn StatisticsSink> {
        &self.statistics
    }

    /// The outbound notification collaborator.
    pub fn gateway(&self) -> &Arc<dyn ClientGateway> {
        &self.gateway
    }
}
