//! Persistence layer: tenant message stores and the tenant directory.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod tenants;
pub mod traits;

pub use libsql_backend::LibSqlMessageStore;
pub use memory::{MemoryMessageStore, StaticTenantDirectory};
pub use tenants::LibSqlTenantDirectory;
pub use traits::{Conversation, MessageMatcher, NewConversation, Reply, TenantDirectory};
