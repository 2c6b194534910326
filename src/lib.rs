//! # repo-kit
//!
//! A generic, versioned, cached CRUD repository layer over document stores.
//!
//! ## Features
//!
//! - **Fully Generic:** One [`Repository`] per entity type `T` implementing [`Entity`]
//! - **Store Agnostic:** Any database implementing [`DocumentStore`]; [`MemoryStore`] ships in-process
//! - **Soft Delete & Restore:** Deleted entities stay in the store and disappear from reads
//! - **Optimistic Versioning:** Every mutation bumps `version`; conflicts are retried with backoff
//! - **Read-Through Cache:** TTL + LRU cache with selectable [`CacheStrategy`] per read
//! - **Batches & Transactions:** Chunked batch writes with per-item reports, retried transactions
//! - **Multi-Tenant:** [`TenantRepository`] scopes every call to one organization
//! - **Degradation Aware:** [`ResilienceQueue`] defers best-effort writes under load
//!
//! ## Quick Start
//!
//! ```ignore
//! use repo_kit::{
//!     CreateOptions, DeleteOptions, Entity, ReadOptions, Repository, RepositoryConfig,
//!     UpdateOptions, store::MemoryStore, strategy::CacheStrategy,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! // 1. Define your entity (metadata fields are managed by the repository)
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     name: String,
//!     email: String,
//! }
//!
//! impl Entity for User {
//!     fn collection() -> &'static str { "users" }
//! }
//!
//! // 2. Create the repository (Clone is cheap - just an Arc increment)
//! let config = RepositoryConfig::new("users").with_required_fields(["email"]);
//! let users: Repository<User, MemoryStore> = Repository::new(MemoryStore::new(), config)?;
//!
//! // 3. Use it
//! let user = users.create(User { name: "Ada".into(), email: "ada@example.com".into() },
//!                         CreateOptions::default()).await?;
//! users.update(&user.id, &serde_json::json!({"name": "Ada L."}), UpdateOptions::default()).await?;
//! let fresh = users.find_by_id(&user.id, ReadOptions::default()
//!     .with_strategy(CacheStrategy::Bypass)).await?;
//! users.delete(&user.id, DeleteOptions::soft()).await?;
//! ```

#[macro_use]
extern crate log;

pub mod batch;
pub mod cache;
pub mod config;
pub mod convert;
pub mod document;
pub mod entity;
pub mod error;
pub mod key;
pub mod observability;
pub mod pagination;
pub mod query;
pub mod repository;
pub mod resilience;
pub mod serialization;
pub mod store;
pub mod strategy;
pub mod transaction;
pub mod validate;

// Re-exports for convenience
pub use batch::{BatchResult, BatchStatus};
pub use config::RepositoryConfig;
pub use entity::{Entity, Record};
pub use error::{Error, Result};
pub use pagination::Page;
pub use query::{Direction, Filter, FilterOp};
pub use repository::{
    CreateOptions, DeleteOptions, QueryOptions, ReadOptions, Repository, RepositoryTransaction,
    TenantRepository, UpdateOptions,
};
pub use resilience::ResilienceQueue;
pub use store::DocumentStore;
#[cfg(feature = "memory")]
pub use store::MemoryStore;
pub use strategy::CacheStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
