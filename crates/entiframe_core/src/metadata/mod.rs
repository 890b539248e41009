//! Metadata model.
//!
//! The model describes entity types, their properties, keys, relationships and
//! store mappings. It is built once by [`ModelBuilder`] and shared read-only
//! (behind an `Arc`) by every query and save.

mod builder;
mod converter;
mod key;
mod model;

pub use builder::{
    EntityTypeBuilder, ForeignKeyBuilder, ModelBuilder, PropertyBuilder, DISCRIMINATOR_PROPERTY,
    ETAG_PROPERTY,
};
pub use converter::{
    convert_from_provider, convert_to_provider, BoolToIntConverter, EnumToStringConverter,
    GuidToStringConverter, ValueConverter,
};
pub use key::{key_factory, EntityKey, KeyFactory, KeyShape};
pub use model::{
    EntityType, ForeignKey, Model, Navigation, Property, StoreKind, StoreMapping, ValueGenerated,
    ValueKind,
};
