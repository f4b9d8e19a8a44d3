pub mod api;
pub mod config;
pub mod logic;
pub mod model;
pub mod services;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

// Export logic types
pub use logic::{
    BranchCreator, BranchDeleter, BranchMerger, BranchQueueOrchestrator, ChangeLogReplayer,
    DataSeeder, SchemaCloner, TableLockGuard,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{BranchQueueStore, ConnectionFactory, MergeDatabase, MySqlStore};
