// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:      Configuration structs loaded from JSON
// - errors:      Typed library errors
// - schema:      Quote / delta / status definitions
// - util:        Shared helpers (time, keys)
// - metrics:     Global lock-free runtime counters
// - cache:       Rate cache trait and backends (local, redis)
// - calculator:  Derived-rate formulas
// - collector:   Platform connector abstraction and transports
// - coordinator: Tolerance filter, dependency graph, event handling
// - publisher:   Outbound distribution of accepted rates
//
pub mod cache;
pub mod calculator;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod metrics;
pub mod publisher;
pub mod schema;
pub mod util;

pub use coordinator::Coordinator;
pub use schema::{AvailabilityStatus, Quote, QuoteDelta};
