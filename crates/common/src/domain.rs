mod clock;
mod event_record;
mod event_store;
mod key_deriver;
mod result;
mod throttle_strategy;

pub use clock::*;
pub use event_record::*;
pub use event_store::*;
pub use key_deriver::*;
pub use result::*;
pub use throttle_strategy::*;
