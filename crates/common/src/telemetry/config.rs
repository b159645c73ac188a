use serde::{Deserialize, Serialize};

/// Configuration for log output
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Fallback filter when `RUST_LOG` is not set
    pub log_level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "event-tracker".to_string(),
            log_level: "info".to_string(),
            json: true,
        }
    }
}
