// Pulse Storage
//
// Durable home for events, funnel/cohort definitions and cohort snapshots.
//
// Key design decisions:
// - A single async EventStore trait; pulse-collector only ever sees `Arc<dyn EventStore>`
// - PostgreSQL (sqlx) for production, in-memory for dev mode and tests
// - Both backends delegate aggregation to pulse-core and are checked by one
//   conformance suite (tests/common)

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use store::{EventStore, InsertOutcome, RetentionRule, StoreError};
