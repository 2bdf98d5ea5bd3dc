mod combine;
pub mod error;
pub mod mapping;
pub mod memory;
pub mod models;
#[cfg(feature = "neo4j")]
pub mod neo4j;
pub mod query;
pub mod role_store;
pub mod schema;
pub mod user_store;

pub mod prelude {
    pub use crate::error::{ErrorKind, Result, StoreError};
    pub use crate::memory::MemoryGraph;
    pub use crate::models::{
        Claim, ContactRecord, ExternalLogin, Occurrence, RemovedEntity, Role, User,
    };
    #[cfg(feature = "neo4j")]
    pub use crate::neo4j::Neo4jGraph;
    pub use crate::query::{GraphQuery, Properties, QueryEngine, Row};
    pub use crate::role_store::RoleStore;
    pub use crate::schema::{EntityKind, GraphSchema};
    pub use crate::user_store::UserStore;
}
