//! relquery core library: turns free-text questions into validated,
//! relationship-aware queries over a typed entity graph.
//!
//! A planning oracle translates the question into a
//! [`RelationshipQueryPlan`](models::RelationshipQueryPlan); the plan is
//! validated against the [`SchemaRegistry`](schema::SchemaRegistry), compiled
//! into parameterized SQL and executed. When the relational tier fails, the
//! [`ReliableQueryService`](query::service::ReliableQueryService) degrades
//! through metadata, vector and keyword tiers before giving up.
//!
//! With the `python` feature the crate also builds the `_relquery_core`
//! extension module via PyO3.

pub mod config;
pub mod errors;
pub mod models;
pub mod query;
pub mod schema;
pub mod store;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use errors::{RelQueryError, RelQueryResult};
pub use query::service::{QueryResponse, ReliableQueryService};
