use crate::domain::{
    build_event_store, build_strategy, DeferredEventHandler, DeferredEventProcessor,
    EventTrackerConfig, EventTrackerService,
};
use common::domain::{Clock, DomainResult, EventStore, SystemClock, ThrottleStrategy};
use common::garde::validate_config;
use std::sync::Arc;
use tracing::info;

/// Assembles an `EventTrackerService` from its collaborators.
///
/// Anything not supplied is built from the config: the store from
/// `store_backend`, the strategy from `strategy`, and the system clock.
/// When a handler is given the deferred event processor is started and
/// runs until `EventTrackerService::shutdown` or until the returned tracker
/// is dropped. Dropping skips `EventStore::destroy`, so call `shutdown` to
/// stop a store's own background work.
///
/// # Example
/// ```ignore
/// let tracker = EventTrackerBuilder::new()
///     .with_config(EventTrackerConfig::load()?)
///     .with_handler(Arc::new(AlertForwarder::new()))
///     .build()
///     .await?;
///
/// tracker.track_event("database", "timeout", json!({"host": "db-1"})).await?;
/// ```
#[derive(Default)]
pub struct EventTrackerBuilder {
    config: EventTrackerConfig,
    store: Option<Arc<dyn EventStore>>,
    strategy: Option<Arc<dyn ThrottleStrategy>>,
    handler: Option<Arc<dyn DeferredEventHandler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EventTrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EventTrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ThrottleStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn DeferredEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> DomainResult<Arc<EventTrackerService>> {
        validate_config(&self.config)?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store = match self.store {
            Some(store) => store,
            None => build_event_store(&self.config, Arc::clone(&clock)).await?,
        };
        let strategy = self
            .strategy
            .unwrap_or_else(|| build_strategy(&self.config));
        let strategy_name = strategy.name();
        let processing_interval = self.config.processing_interval();

        let service = Arc::new(EventTrackerService::new(store, strategy, clock, self.config));

        if let Some(handler) = self.handler {
            let token = service.shutdown_token().child_token();
            DeferredEventProcessor::new(&service, handler, processing_interval).spawn(token);
        }

        info!(strategy = strategy_name, "event tracker ready");
        Ok(service)
    }
}
