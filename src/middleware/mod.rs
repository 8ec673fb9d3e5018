// Middleware for resilient service calls
//
// Circuit breaking around the translation service

pub mod circuit_breaker;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
