// Protection for the shared model capability
//
// Circuit breaking per capability plus a global in-flight bound

pub mod circuit_breaker;
pub mod model_gate;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use model_gate::ModelGate;
