//! The role aggregate facade. Mirrors the user store's shape: guard, fail
//! fast on existence, compose through the mapping layer, combine on the way
//! back. Roles own only claims; memberships belong to the user side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::combine;
use crate::error::{Result, StoreError};
use crate::mapping;
use crate::models::Role;
use crate::query::{GraphQuery, Properties, QueryEngine, ReturnSpec};
use crate::schema::GraphSchema;

pub struct RoleStore {
    engine: Arc<dyn QueryEngine>,
    schema: GraphSchema,
    cancel: CancellationToken,
    disposed: Arc<AtomicBool>,
}

impl RoleStore {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self::with_schema(engine, GraphSchema::default())
    }

    pub fn with_schema(engine: Arc<dyn QueryEngine>, schema: GraphSchema) -> Self {
        Self {
            engine,
            schema,
            cancel: CancellationToken::new(),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle over the same store bound to its own token. Disposal is
    /// shared with the originating handle.
    pub fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            engine: self.engine.clone(),
            schema: self.schema.clone(),
            cancel,
            disposed: self.disposed.clone(),
        }
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn guard(&self, operation: &'static str) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StoreError::disposed("RoleStore"));
        }
        if self.cancel.is_cancelled() {
            return Err(StoreError::cancelled(operation));
        }
        Ok(())
    }

    async fn fetch_unique(&self, query: GraphQuery) -> Result<Option<Role>> {
        let rows = self.engine.fetch(&query).await?;
        match rows.len() {
            0 => Ok(None),
            1 => combine::combine_role(&rows[0]).map(Some),
            matched => Err(StoreError::conflict_with_code(
                "multiple_matches",
                "Multiple roles matched a unique lookup",
                anyhow!("{matched} rows where at most one was expected"),
            )),
        }
    }

    async fn count_matches(&self, id: &str) -> Result<usize> {
        let query = mapping::match_role_by_id(&self.schema, id).returning(ReturnSpec {
            root: mapping::ROLE_ALIAS.to_string(),
            collect: vec![],
        });
        Ok(self.engine.fetch(&query).await?.len())
    }

    /// Writes abort with no mutation unless the identity key matches exactly
    /// one node.
    async fn require_unique(&self, id: &str, action: &'static str) -> Result<()> {
        match self.count_matches(id).await? {
            0 => Err(StoreError::not_found(
                "Role does not exist",
                anyhow!("{action} targeted missing role {id}"),
            )),
            1 => Ok(()),
            matched => Err(StoreError::conflict_with_code(
                "multiple_matches",
                "Multiple roles share this identity key",
                anyhow!("{action} matched {matched} nodes for role {id}"),
            )),
        }
    }

    /// Persists a brand-new role node. Claims are attached through
    /// [`update`](Self::update) once the root exists.
    pub async fn create(&self, role: &Role) -> Result<()> {
        self.guard("create_role")?;
        if role.name().map_or(true, |name| name.trim().is_empty()) {
            return Err(StoreError::invalid(
                "Role name is required",
                anyhow!("create with a blank role name"),
            ));
        }
        if !role.claims().is_empty() {
            return Err(StoreError::invalid(
                "Create does not accept attached claims",
                anyhow!("role {} arrived with {} claims", role.id(), role.claims().len()),
            ));
        }
        if self.count_matches(role.id()).await? > 0 {
            return Err(StoreError::conflict_with_code(
                "duplicate_identity",
                "A role with this id already exists",
                anyhow!("create would duplicate role {}", role.id()),
            ));
        }
        if let Some(normalized) = role.normalized_name() {
            if self.find_by_name(normalized).await?.is_some() {
                return Err(StoreError::conflict_with_code(
                    "duplicate_identity",
                    "A role with this name already exists",
                    anyhow!("create would duplicate normalized name {normalized}"),
                ));
            }
        }

        debug!(role_id = role.id(), "creating role");
        self.engine
            .run(&mapping::create_role(&self.schema, role))
            .await
    }

    /// Persists scalar state, journaled claim removals, and claim merges in
    /// one composed query. The caller clears the journal with
    /// [`Role::mark_persisted`] after a successful update.
    pub async fn update(&self, role: &Role) -> Result<()> {
        self.guard("update_role")?;
        self.require_unique(role.id(), "update").await?;
        debug!(
            role_id = role.id(),
            removed = role.removed_claims().len(),
            "updating role"
        );
        self.engine
            .run(&mapping::update_role(&self.schema, role))
            .await
    }

    /// Removes the role node and its owned claim nodes. Membership edges
    /// from users are detached with the node.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.guard("delete_role")?;
        self.require_unique(id, "delete").await?;
        debug!(role_id = id, "deleting role");
        self.engine.run(&mapping::delete_role(&self.schema, id)).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Role>> {
        self.guard("find_role_by_id")?;
        self.fetch_unique(mapping::with_role_relations(
            mapping::match_role_by_id(&self.schema, id),
            &self.schema,
        ))
        .await
    }

    /// Lookup by normalized name; the caller normalizes.
    pub async fn find_by_name(&self, normalized_name: &str) -> Result<Option<Role>> {
        self.guard("find_role_by_name")?;
        let mut constraints = Properties::new();
        constraints.insert(
            "normalized_name".to_string(),
            Value::String(normalized_name.to_string()),
        );
        self.fetch_unique(mapping::with_role_relations(
            mapping::match_role(&self.schema, constraints),
            &self.schema,
        ))
        .await
    }
}
