pub mod registry;

pub use registry::{ResolvedHop, SchemaContext, SchemaDefinition, SchemaRegistry};
