//! Namespace records and their persistent store (§3, §4.2).

mod model;
mod repository;

pub use model::{AuthType, Namespace};
pub use repository::{InvalidationHook, NamespaceRepository};
