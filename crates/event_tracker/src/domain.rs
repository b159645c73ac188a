mod counter_strategy;
mod deferred_processor;
mod event_tracker_builder;
mod event_tracker_config;
mod event_tracker_factory;
mod event_tracker_service;
mod notification;
mod token_bucket_strategy;

pub use counter_strategy::*;
pub use deferred_processor::*;
pub use event_tracker_builder::*;
pub use event_tracker_config::*;
pub use event_tracker_factory::*;
pub use event_tracker_service::*;
pub use notification::*;
pub use token_bucket_strategy::*;
