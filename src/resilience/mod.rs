//! Resilience - Schutz vor wiederholt fehlschlagenden externen Diensten

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
