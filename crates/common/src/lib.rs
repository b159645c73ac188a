pub mod domain;
pub mod garde;
pub mod memory;
pub mod redis;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockEventStore;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockThrottleStrategy;
