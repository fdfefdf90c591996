//! In-memory entity tree: Owner -> Repository -> Build -> Run
//!
//! Parents own their children through [`KeyedMap`]s. Children point back at
//! their parents with key structs from [`crate::id`], resolved through the
//! provider that owns the tree.

pub mod build;
pub mod keyed;
pub mod owner;
pub mod repository;
pub mod run;

pub use build::{Build, BuildSummary};
pub use keyed::KeyedMap;
pub use owner::Owner;
pub use repository::Repository;
pub use run::{Run, RunSnapshot, RunState, RunStatus};
