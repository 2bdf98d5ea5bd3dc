//! The user aggregate facade. Owns no graph state itself: every operation
//! composes a [`GraphQuery`](crate::query::GraphQuery) through the mapping
//! layer and hands it to the configured engine. Writes fail fast on
//! existence checks before any mutation is issued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::combine;
use crate::error::{Result, StoreError};
use crate::mapping;
use crate::models::User;
use crate::query::{GraphQuery, Properties, QueryEngine};
use crate::schema::GraphSchema;

pub struct UserStore {
    engine: Arc<dyn QueryEngine>,
    schema: GraphSchema,
    cancel: CancellationToken,
    disposed: Arc<AtomicBool>,
}

impl UserStore {
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

    /// Ties every subsequent operation to the token: once it is cancelled,
    /// operations fail before issuing a query.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle over the same store bound to its own token, for callers that
    /// scope cancellation per call rather than per store. Disposal is shared
    /// with the originating handle.
    pub fn scoped(&self, cancel: CancellationToken) -> Self {
        Self {
            engine: self.engine.clone(),
            schema: self.schema.clone(),
            cancel,
            disposed: self.disposed.clone(),
        }
    }

    /// Marks the store unusable. Subsequent operations fail with a disposed
    /// error; in-flight queries are not interrupted.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn guard(&self, operation: &'static str) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StoreError::disposed("UserStore"));
        }
        if self.cancel.is_cancelled() {
            return Err(StoreError::cancelled(operation));
        }
        Ok(())
    }

    async fn fetch_unique(&self, query: GraphQuery) -> Result<Option<User>> {
        let rows = self.engine.fetch(&query).await?;
        match rows.len() {
            0 => Ok(None),
            1 => combine::combine_user(&rows[0]).map(Some),
            matched => Err(StoreError::conflict_with_code(
                "multiple_matches",
                "Multiple users matched a unique lookup",
                anyhow!("{matched} rows where at most one was expected"),
            )),
        }
    }

    async fn fetch_all(&self, query: GraphQuery) -> Result<Vec<User>> {
        self.engine
            .fetch(&query)
            .await?
            .iter()
            .map(combine::combine_user)
            .collect()
    }

    async fn count_matches(&self, id: &str) -> Result<usize> {
        let query = mapping::match_user_by_id(&self.schema, id).returning(
            crate::query::ReturnSpec {
                root: mapping::USER_ALIAS.to_string(),
                collect: vec![],
            },
        );
        Ok(self.engine.fetch(&query).await?.len())
    }

    /// Writes abort with no mutation unless the identity key matches exactly
    /// one node.
    async fn require_unique(&self, id: &str, action: &'static str) -> Result<()> {
        match self.count_matches(id).await? {
            0 => Err(StoreError::not_found(
                "User does not exist",
                anyhow!("{action} targeted missing user {id}"),
            )),
            1 => Ok(()),
            matched => Err(StoreError::conflict_with_code(
                "multiple_matches",
                "Multiple users share this identity key",
                anyhow!("{action} matched {matched} nodes for user {id}"),
            )),
        }
    }

    /// Persists a brand-new user node. The aggregate must arrive with empty
    /// claim, login, and role collections; sub-entities are attached through
    /// [`update`](Self::update) once the root exists.
    pub async fn create(&self, user: &User) -> Result<()> {
        self.guard("create_user")?;
        if user.user_name().map_or(true, |name| name.trim().is_empty()) {
            return Err(StoreError::invalid(
                "User name is required",
                anyhow!("create with a blank user name"),
            ));
        }
        if !user.claims().is_empty() || !user.logins().is_empty() || !user.roles().is_empty() {
            return Err(StoreError::invalid(
                "Create does not accept attached collections",
                anyhow!(
                    "user {} arrived with {} claims, {} logins, {} roles",
                    user.id(),
                    user.claims().len(),
                    user.logins().len(),
                    user.roles().len()
                ),
            ));
        }
        if self.count_matches(user.id()).await? > 0 {
            return Err(StoreError::conflict_with_code(
                "duplicate_identity",
                "A user with this id already exists",
                anyhow!("create would duplicate user {}", user.id()),
            ));
        }
        if let Some(normalized) = user.normalized_user_name() {
            let existing = self
                .fetch_unique(mapping::with_user_relations(
                    mapping::match_user(
                        &self.schema,
                        name_constraint("normalized_user_name", normalized),
                    ),
                    &self.schema,
                ))
                .await?;
            if existing.is_some() {
                return Err(StoreError::conflict_with_code(
                    "duplicate_identity",
                    "A user with this name already exists",
                    anyhow!("create would duplicate normalized name {normalized}"),
                ));
            }
        }

        debug!(user_id = user.id(), "creating user");
        self.engine
            .run(&mapping::create_user(&self.schema, user))
            .await
    }

    /// Persists scalar state, journaled removals, and collection merges in
    /// one composed query. The caller clears the removal journal with
    /// [`User::mark_persisted`] after a successful update.
    pub async fn update(&self, user: &User) -> Result<()> {
        self.guard("update_user")?;
        self.require_unique(user.id(), "update").await?;
        debug!(
            user_id = user.id(),
            removed = user.removed().len(),
            "updating user"
        );
        self.engine
            .run(&mapping::update_user(&self.schema, user))
            .await
    }

    /// Removes the user node, its owned claim and login nodes, and every
    /// incident edge. Role nodes are left untouched.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.guard("delete_user")?;
        self.require_unique(id, "delete").await?;
        debug!(user_id = id, "deleting user");
        self.engine.run(&mapping::delete_user(&self.schema, id)).await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        self.guard("find_user_by_id")?;
        self.fetch_unique(mapping::with_user_relations(
            mapping::match_user_by_id(&self.schema, id),
            &self.schema,
        ))
        .await
    }

    /// Lookup by normalized user name; the caller normalizes.
    pub async fn find_by_name(&self, normalized_user_name: &str) -> Result<Option<User>> {
        self.guard("find_user_by_name")?;
        self.fetch_unique(mapping::with_user_relations(
            mapping::match_user(
                &self.schema,
                name_constraint("normalized_user_name", normalized_user_name),
            ),
            &self.schema,
        ))
        .await
    }

    /// Lookup by normalized email; the caller normalizes.
    pub async fn find_by_email(&self, normalized_email: &str) -> Result<Option<User>> {
        self.guard("find_user_by_email")?;
        self.fetch_unique(mapping::with_user_relations(
            mapping::match_user(
                &self.schema,
                name_constraint("normalized_email", normalized_email),
            ),
            &self.schema,
        ))
        .await
    }

    /// Lookup by the natural key of an attached external login.
    pub async fn find_by_login(
        &self,
        login_provider: &str,
        provider_key: &str,
    ) -> Result<Option<User>> {
        self.guard("find_user_by_login")?;
        self.fetch_unique(mapping::with_user_relations(
            mapping::match_user_by_login(&self.schema, login_provider, provider_key),
            &self.schema,
        ))
        .await
    }

    /// Every user holding a membership edge into the named role. Unknown
    /// roles yield an empty list, not an error.
    pub async fn users_in_role(&self, normalized_role_name: &str) -> Result<Vec<User>> {
        self.guard("users_in_role")?;
        if normalized_role_name.trim().is_empty() {
            return Err(StoreError::invalid(
                "Role name is required",
                anyhow!("blank role name in membership lookup"),
            ));
        }
        self.fetch_all(mapping::with_user_relations(
            mapping::match_users_in_role(&self.schema, normalized_role_name),
            &self.schema,
        ))
        .await
    }

    /// Every user owning a claim with the given natural key.
    pub async fn users_for_claim(&self, claim_type: &str, value: &str) -> Result<Vec<User>> {
        self.guard("users_for_claim")?;
        if claim_type.trim().is_empty() {
            return Err(StoreError::invalid(
                "Claim type is required",
                anyhow!("blank claim type in claim lookup"),
            ));
        }
        self.fetch_all(mapping::with_user_relations(
            mapping::match_users_for_claim(&self.schema, claim_type, value),
            &self.schema,
        ))
        .await
    }
}

fn name_constraint(key: &str, value: &str) -> Properties {
    let mut constraints = Properties::new();
    constraints.insert(key.to_string(), Value::String(value.to_string()));
    constraints
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::memory::MemoryGraph;
    use crate::models::{Claim, ContactRecord, ExternalLogin, Role};
    use crate::role_store::RoleStore;

    use super::*;

    fn stores() -> (Arc<MemoryGraph>, UserStore, RoleStore) {
        let graph = Arc::new(MemoryGraph::new());
        let users = UserStore::new(graph.clone());
        let roles = RoleStore::new(graph.clone());
        (graph, users, roles)
    }

    fn sample_user(name: &str) -> User {
        let mut user = User::with_email(name, format!("{name}@example.com"));
        user.set_normalized_user_name(name.to_uppercase());
        user.email_mut().set_normalized(format!("{}@EXAMPLE.COM", name.to_uppercase()));
        user
    }

    async fn seed_role(roles: &RoleStore, name: &str) -> Role {
        let mut role = Role::new(name);
        role.set_normalized_name(name.to_uppercase());
        roles.create(&role).await.expect("role create");
        role
    }

    #[tokio::test]
    async fn create_then_find_round_trips_scalars() {
        let (_, users, _) = stores();
        let mut user = sample_user("alice");
        user.set_password_hash(Some("hash".to_string()));
        user.email_mut().set_confirmed();
        users.create(&user).await.expect("create");

        let found = users
            .find_by_id(user.id())
            .await
            .expect("find")
            .expect("user exists");
        assert_eq!(found.user_name(), Some("alice"));
        assert_eq!(found.password_hash(), Some("hash"));
        assert!(found.email().is_confirmed());
        assert!(found.claims().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_attached_collections() {
        let (_, users, _) = stores();
        let mut user = sample_user("alice");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));

        let err = users.create(&user).await.expect_err("must reject");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let (_, users, _) = stores();
        let user = sample_user("alice");
        users.create(&user).await.expect("first create");

        let err = users.create(&user).await.expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.code, "duplicate_identity");
    }

    #[tokio::test]
    async fn duplicate_normalized_name_conflicts() {
        let (_, users, _) = stores();
        users.create(&sample_user("alice")).await.expect("first create");

        let err = users
            .create(&sample_user("alice"))
            .await
            .expect_err("same normalized name");
        assert_eq!(err.code, "duplicate_identity");
    }

    #[tokio::test]
    async fn update_of_missing_user_is_not_found() {
        let (_, users, _) = stores();
        let err = users
            .update(&sample_user("ghost"))
            .await
            .expect_err("missing");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn writes_abort_when_the_identity_key_is_duplicated() {
        let (graph, users, _) = stores();
        let user = sample_user("alice");
        users.create(&user).await.expect("create");

        // A second root carrying the same identity key, injected behind the
        // store's back.
        graph
            .run(&GraphQuery::new().create(
                "dup",
                "IdentityUser",
                name_constraint("id", user.id()),
            ))
            .await
            .expect("seed duplicate");

        let err = users.update(&user).await.expect_err("update must abort");
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.code, "multiple_matches");

        let err = users.delete(user.id()).await.expect_err("delete must abort");
        assert_eq!(err.code, "multiple_matches");
    }

    #[tokio::test]
    async fn update_persists_claims_and_logins() {
        let (graph, users, _) = stores();
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");

        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        user.add_login(ExternalLogin::new("github", "key-1", Some("GitHub".to_string())));
        users.update(&user).await.expect("update");

        let found = users
            .find_by_id(user.id())
            .await
            .expect("find")
            .expect("user exists");
        assert_eq!(found.claims().len(), 1);
        assert_eq!(found.logins().len(), 1);
        assert_eq!(found.logins()[0].provider_display_name(), Some("GitHub"));
        assert_eq!(graph.node_count("IdentityClaim").await, 1);
        assert_eq!(graph.edge_count("HAS_LOGIN").await, 1);
    }

    #[tokio::test]
    async fn repeated_update_is_idempotent() {
        let (graph, users, _) = stores();
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));

        users.update(&user).await.expect("first update");
        users.update(&user).await.expect("second update");

        assert_eq!(graph.node_count("IdentityClaim").await, 1);
        assert_eq!(graph.edge_count("HAS_CLAIM").await, 1);
    }

    #[tokio::test]
    async fn journaled_removal_detaches_on_update() {
        let (graph, users, _) = stores();
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        users.update(&user).await.expect("attach");

        assert!(user.remove_claim("scope", "read"));
        users.update(&user).await.expect("detach");
        user.mark_persisted();

        let found = users
            .find_by_id(user.id())
            .await
            .expect("find")
            .expect("user exists");
        assert!(found.claims().is_empty());
        assert_eq!(graph.node_count("IdentityClaim").await, 0);
    }

    #[tokio::test]
    async fn remove_then_re_add_in_one_unit_ends_present() {
        let (graph, users, _) = stores();
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        users.update(&user).await.expect("attach");

        user.remove_claim("scope", "read");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        users.update(&user).await.expect("remove and re-add");

        let found = users
            .find_by_id(user.id())
            .await
            .expect("find")
            .expect("user exists");
        assert_eq!(found.claims().len(), 1);
        assert_eq!(graph.node_count("IdentityClaim").await, 1);
    }

    #[tokio::test]
    async fn membership_merges_edge_against_existing_role() {
        let (graph, users, roles) = stores();
        seed_role(&roles, "Admin").await;
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");

        user.add_role("Admin").expect("valid role");
        users.update(&user).await.expect("update");
        users.update(&user).await.expect("idempotent update");

        assert_eq!(graph.edge_count("IN_ROLE").await, 1);
        assert_eq!(graph.node_count("IdentityRole").await, 1);

        let found = users
            .find_by_id(user.id())
            .await
            .expect("find")
            .expect("user exists");
        assert!(found.has_role("admin"));
    }

    #[tokio::test]
    async fn removing_membership_keeps_the_role_node() {
        let (graph, users, roles) = stores();
        seed_role(&roles, "Admin").await;
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");
        user.add_role("Admin").expect("valid role");
        users.update(&user).await.expect("attach membership");

        assert!(user.remove_role("Admin"));
        users.update(&user).await.expect("detach membership");

        assert_eq!(graph.edge_count("IN_ROLE").await, 0);
        assert_eq!(graph.node_count("IdentityRole").await, 1);
    }

    #[tokio::test]
    async fn users_in_role_lists_members_only() {
        let (_, users, roles) = stores();
        seed_role(&roles, "Admin").await;
        let mut alice = sample_user("alice");
        users.create(&alice).await.expect("create alice");
        alice.add_role("Admin").expect("valid role");
        users.update(&alice).await.expect("update alice");
        users.create(&sample_user("bob")).await.expect("create bob");

        let members = users.users_in_role("ADMIN").await.expect("lookup");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_name(), Some("alice"));

        let none = users.users_in_role("AUDITOR").await.expect("lookup");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn users_for_claim_matches_natural_key() {
        let (_, users, _) = stores();
        let mut alice = sample_user("alice");
        users.create(&alice).await.expect("create alice");
        alice.add_claim(Claim::new("scope", "read").expect("valid claim"));
        users.update(&alice).await.expect("update alice");

        let mut bob = sample_user("bob");
        users.create(&bob).await.expect("create bob");
        bob.add_claim(Claim::new("scope", "write").expect("valid claim"));
        users.update(&bob).await.expect("update bob");

        let readers = users.users_for_claim("scope", "read").await.expect("lookup");
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0].user_name(), Some("alice"));
    }

    #[tokio::test]
    async fn find_by_login_roots_on_the_login_key() {
        let (_, users, _) = stores();
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");
        user.add_login(ExternalLogin::new("github", "key-1", None));
        users.update(&user).await.expect("update");

        let found = users
            .find_by_login("github", "key-1")
            .await
            .expect("find")
            .expect("user exists");
        assert_eq!(found.id(), user.id());

        let missing = users.find_by_login("github", "key-2").await.expect("find");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn find_by_email_uses_normalized_value() {
        let (_, users, _) = stores();
        let user = sample_user("alice");
        users.create(&user).await.expect("create");

        let found = users
            .find_by_email("ALICE@EXAMPLE.COM")
            .await
            .expect("find");
        assert!(found.is_some());

        let missing = users.find_by_email("alice@example.com").await.expect("find");
        assert!(missing.is_none(), "lookups never normalize on behalf of the caller");
    }

    #[tokio::test]
    async fn delete_removes_owned_nodes_but_not_roles() {
        let (graph, users, roles) = stores();
        seed_role(&roles, "Admin").await;
        let mut user = sample_user("alice");
        users.create(&user).await.expect("create");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        user.add_login(ExternalLogin::new("github", "key-1", None));
        user.add_role("Admin").expect("valid role");
        users.update(&user).await.expect("update");

        users.delete(user.id()).await.expect("delete");

        assert_eq!(graph.node_count("IdentityUser").await, 0);
        assert_eq!(graph.node_count("IdentityClaim").await, 0);
        assert_eq!(graph.node_count("IdentityLogin").await, 0);
        assert_eq!(graph.node_count("IdentityRole").await, 1);
        assert_eq!(graph.edge_count("IN_ROLE").await, 0);

        let err = users.delete(user.id()).await.expect_err("already gone");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_clears_scalars_set_to_none() {
        let (_, users, _) = stores();
        let mut user = sample_user("alice");
        user.set_password_hash(Some("hash".to_string()));
        users.create(&user).await.expect("create");

        user.set_password_hash(None);
        user.set_email(ContactRecord::empty());
        users.update(&user).await.expect("update");

        let found = users
            .find_by_id(user.id())
            .await
            .expect("find")
            .expect("user exists");
        assert_eq!(found.password_hash(), None);
        assert_eq!(found.email().value(), None);
    }

    #[tokio::test]
    async fn disposed_store_rejects_operations() {
        let (_, users, _) = stores();
        users.dispose();

        let err = users.find_by_id("user_1").await.expect_err("disposed");
        assert_eq!(err.kind, ErrorKind::Disposed);
    }

    #[tokio::test]
    async fn scoped_handle_cancels_one_call_without_touching_the_store() {
        let (_, users, _) = stores();
        let user = sample_user("alice");
        users.create(&user).await.expect("create");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = users
            .scoped(cancel)
            .find_by_id(user.id())
            .await
            .expect_err("scoped call is cancelled");
        assert_eq!(err.kind, ErrorKind::Cancelled);

        // The originating handle keeps working, and disposal still reaches
        // scoped handles.
        assert!(users.find_by_id(user.id()).await.expect("find").is_some());
        let scoped = users.scoped(CancellationToken::new());
        users.dispose();
        let err = scoped.find_by_id(user.id()).await.expect_err("disposed");
        assert_eq!(err.kind, ErrorKind::Disposed);
    }

    #[tokio::test]
    async fn engine_failure_passes_through_as_unavailable() {
        struct BrokenEngine;

        #[async_trait::async_trait]
        impl crate::query::QueryEngine for BrokenEngine {
            async fn run(&self, _query: &GraphQuery) -> Result<()> {
                Err(StoreError::unavailable(
                    "Graph engine request failed",
                    anyhow!("connection refused"),
                ))
            }

            async fn fetch(&self, _query: &GraphQuery) -> Result<Vec<crate::query::Row>> {
                Err(StoreError::unavailable(
                    "Graph engine request failed",
                    anyhow!("connection refused"),
                ))
            }
        }

        let users = UserStore::new(Arc::new(BrokenEngine));
        let err = users.find_by_id("user_1").await.expect_err("engine down");
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(err.code, "engine_unavailable");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_io() {
        let graph = Arc::new(MemoryGraph::new());
        let cancel = CancellationToken::new();
        let users = UserStore::new(graph).with_cancellation(cancel.clone());

        users.create(&sample_user("alice")).await.expect("create");
        cancel.cancel();

        let err = users.find_by_id("user_1").await.expect_err("cancelled");
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
