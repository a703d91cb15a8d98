pub mod exponential_backoff;
pub mod random;
pub mod timers;
