pub mod entity_cache;
pub mod resolvers;

pub use resolvers::EntityResolver;
