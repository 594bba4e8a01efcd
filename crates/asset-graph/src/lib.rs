//! Typed asset/relation model for the discovered-knowledge graph, and the
//! abstract store contract every backend implements.
//!
//! The engine never talks to a concrete database; it goes through
//! [`GraphStore`]. Natural-key derivation is centralized in [`Asset::key`] so
//! that upsert-by-natural-key gives the same identity to the same fact no
//! matter which plugin produced it.

mod asset;
mod relation;
mod store;

pub use asset::{Asset, AssetKind, IpFamily};
pub use relation::{Relation, RelationLabel};
pub use store::{AssetId, DynGraphStore, GraphStore, RelationId, StoredAsset};
