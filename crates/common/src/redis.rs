mod client;
mod redis_event_store;

pub use client::*;
pub use redis_event_store::*;
