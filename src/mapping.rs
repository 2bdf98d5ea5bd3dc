//! Composes [`GraphQuery`] values for the identity aggregates. Update
//! composition is the delicate part: removal fragments come first and use
//! alias indices offset past the surviving collection so no alias collides
//! with a merge fragment in the same query.

use serde_json::Value;

use crate::combine;
use crate::models::{Claim, ExternalLogin, RemovedEntity, Role, User};
use crate::query::{GraphQuery, NodeRef, OnCreateSet, Pattern, Properties, RelPattern, ReturnSpec};
use crate::schema::GraphSchema;

pub const USER_ALIAS: &str = "u";
pub const ROLE_ALIAS: &str = "r";

/// Collection aliases used by find queries and consumed by the combiner.
pub const CLAIM_COLLECTION: &str = "claim";
pub const LOGIN_COLLECTION: &str = "login";
pub const ROLE_COLLECTION: &str = "role";

fn key_props(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect()
}

fn single_prop(key: &str, value: &str) -> Properties {
    key_props(&[(key, value)])
}

/// `MATCH (u:User {constraints})`.
pub fn match_user(schema: &GraphSchema, constraints: Properties) -> GraphQuery {
    GraphQuery::new().match_pattern(Pattern::node(NodeRef::constrained(
        USER_ALIAS,
        &schema.user_label,
        constraints,
    )))
}

pub fn match_user_by_id(schema: &GraphSchema, id: &str) -> GraphQuery {
    match_user(schema, single_prop("id", id))
}

pub fn match_role(schema: &GraphSchema, constraints: Properties) -> GraphQuery {
    GraphQuery::new().match_pattern(Pattern::node(NodeRef::constrained(
        ROLE_ALIAS,
        &schema.role_label,
        constraints,
    )))
}

pub fn match_role_by_id(schema: &GraphSchema, id: &str) -> GraphQuery {
    match_role(schema, single_prop("id", id))
}

/// Roots the user on an owned login's natural key.
pub fn match_user_by_login(
    schema: &GraphSchema,
    login_provider: &str,
    provider_key: &str,
) -> GraphQuery {
    GraphQuery::new().match_pattern(Pattern::related(
        NodeRef::labeled(USER_ALIAS, &schema.user_label),
        RelPattern::new("lk_rel", &schema.login_edge),
        NodeRef::constrained(
            "lk",
            &schema.login_label,
            key_props(&[
                ("login_provider", login_provider),
                ("provider_key", provider_key),
            ]),
        ),
    ))
}

/// Roots every user holding a membership edge into the named role.
pub fn match_users_in_role(schema: &GraphSchema, normalized_role_name: &str) -> GraphQuery {
    GraphQuery::new().match_pattern(Pattern::related(
        NodeRef::labeled(USER_ALIAS, &schema.user_label),
        RelPattern::new("rk_rel", &schema.membership_edge),
        NodeRef::constrained(
            "rk",
            &schema.role_label,
            single_prop("normalized_name", normalized_role_name),
        ),
    ))
}

/// Roots every user owning a claim with the given natural key.
pub fn match_users_for_claim(
    schema: &GraphSchema,
    claim_type: &str,
    value: &str,
) -> GraphQuery {
    GraphQuery::new().match_pattern(Pattern::related(
        NodeRef::labeled(USER_ALIAS, &schema.user_label),
        RelPattern::new("ck_rel", &schema.claim_edge),
        NodeRef::constrained(
            "ck",
            &schema.claim_label,
            key_props(&[("type", claim_type), ("value", value)]),
        ),
    ))
}

/// Appends the optional relationship hops and the grouped projection to a
/// query whose root user alias is already bound.
pub fn with_user_relations(query: GraphQuery, schema: &GraphSchema) -> GraphQuery {
    query
        .optional_match(Pattern::related(
            NodeRef::bound(USER_ALIAS),
            RelPattern::new("claim_rel", &schema.claim_edge),
            NodeRef::labeled(CLAIM_COLLECTION, &schema.claim_label),
        ))
        .optional_match(Pattern::related(
            NodeRef::bound(USER_ALIAS),
            RelPattern::new("login_rel", &schema.login_edge),
            NodeRef::labeled(LOGIN_COLLECTION, &schema.login_label),
        ))
        .optional_match(Pattern::related(
            NodeRef::bound(USER_ALIAS),
            RelPattern::new("role_rel", &schema.membership_edge),
            NodeRef::labeled(ROLE_COLLECTION, &schema.role_label),
        ))
        .returning(ReturnSpec {
            root: USER_ALIAS.to_string(),
            collect: vec![
                CLAIM_COLLECTION.to_string(),
                LOGIN_COLLECTION.to_string(),
                ROLE_COLLECTION.to_string(),
            ],
        })
}

pub fn with_role_relations(query: GraphQuery, schema: &GraphSchema) -> GraphQuery {
    query
        .optional_match(Pattern::related(
            NodeRef::bound(ROLE_ALIAS),
            RelPattern::new("claim_rel", &schema.claim_edge),
            NodeRef::labeled(CLAIM_COLLECTION, &schema.claim_label),
        ))
        .returning(ReturnSpec {
            root: ROLE_ALIAS.to_string(),
            collect: vec![CLAIM_COLLECTION.to_string()],
        })
}

pub fn create_user(schema: &GraphSchema, user: &User) -> GraphQuery {
    GraphQuery::new().create(USER_ALIAS, &schema.user_label, combine::user_properties(user))
}

pub fn create_role(schema: &GraphSchema, role: &Role) -> GraphQuery {
    GraphQuery::new().create(ROLE_ALIAS, &schema.role_label, combine::role_properties(role))
}

/// One merge fragment per present claim: `MERGE (parent)-[cr{i}]->(c{i} {key})`
/// with the full properties assigned only on create. Re-running the same
/// composition creates nothing.
pub fn merge_claims(
    mut query: GraphQuery,
    schema: &GraphSchema,
    parent_alias: &str,
    claims: &[Claim],
) -> GraphQuery {
    for (index, claim) in claims.iter().enumerate() {
        let node_alias = format!("c{index}");
        query = query.merge(
            Pattern::related(
                NodeRef::bound(parent_alias),
                RelPattern::new(format!("cr{index}"), &schema.claim_edge),
                NodeRef::constrained(
                    &node_alias,
                    &schema.claim_label,
                    combine::claim_key_properties(claim),
                ),
            ),
            vec![OnCreateSet {
                alias: node_alias,
                props: combine::claim_properties(claim),
            }],
        );
    }
    query
}

/// One removal fragment per journaled claim. Aliases continue past the
/// surviving collection (`offset` is its length) so removals and merges can
/// share a composition.
pub fn remove_claims(
    mut query: GraphQuery,
    schema: &GraphSchema,
    parent_alias: &str,
    removed: &[&Claim],
    offset: usize,
) -> GraphQuery {
    for (index, claim) in removed.iter().enumerate() {
        let index = index + offset;
        let node_alias = format!("c{index}");
        let rel_alias = format!("cr{index}");
        query = query
            .optional_match(Pattern::related(
                NodeRef::bound(parent_alias),
                RelPattern::new(&rel_alias, &schema.claim_edge),
                NodeRef::constrained(
                    &node_alias,
                    &schema.claim_label,
                    combine::claim_key_properties(claim),
                ),
            ))
            .delete(vec![node_alias, rel_alias]);
    }
    query
}

pub fn merge_logins(
    mut query: GraphQuery,
    schema: &GraphSchema,
    logins: &[ExternalLogin],
) -> GraphQuery {
    for (index, login) in logins.iter().enumerate() {
        let node_alias = format!("l{index}");
        query = query.merge(
            Pattern::related(
                NodeRef::bound(USER_ALIAS),
                RelPattern::new(format!("lr{index}"), &schema.login_edge),
                NodeRef::constrained(
                    &node_alias,
                    &schema.login_label,
                    combine::login_key_properties(login),
                ),
            ),
            vec![OnCreateSet {
                alias: node_alias,
                props: combine::login_properties(login),
            }],
        );
    }
    query
}

pub fn remove_logins(
    mut query: GraphQuery,
    schema: &GraphSchema,
    removed: &[&ExternalLogin],
    offset: usize,
) -> GraphQuery {
    for (index, login) in removed.iter().enumerate() {
        let index = index + offset;
        let node_alias = format!("l{index}");
        let rel_alias = format!("lr{index}");
        query = query
            .optional_match(Pattern::related(
                NodeRef::bound(USER_ALIAS),
                RelPattern::new(&rel_alias, &schema.login_edge),
                NodeRef::constrained(
                    &node_alias,
                    &schema.login_label,
                    combine::login_key_properties(login),
                ),
            ))
            .delete(vec![node_alias, rel_alias]);
    }
    query
}

/// One membership fragment per role-name reference: match the role node by
/// its normalized name, then merge only the edge. Role nodes are never
/// created from the user side; a missing role drops the row and the write
/// surfaces nothing for it.
pub fn merge_memberships(
    mut query: GraphQuery,
    schema: &GraphSchema,
    roles: &[String],
) -> GraphQuery {
    for (index, role) in roles.iter().enumerate() {
        let role_alias = format!("r{index}");
        query = query
            .match_pattern(Pattern::node(NodeRef::constrained(
                &role_alias,
                &schema.role_label,
                single_prop("normalized_name", &role.to_uppercase()),
            )))
            .merge(
                Pattern::related(
                    NodeRef::bound(USER_ALIAS),
                    RelPattern::new(format!("ur{index}"), &schema.membership_edge),
                    NodeRef::bound(&role_alias),
                ),
                vec![OnCreateSet {
                    alias: format!("ur{index}"),
                    props: combine::membership_properties(),
                }],
            );
    }
    query
}

/// Deletes only the membership edge; the role node always survives.
pub fn remove_memberships(
    mut query: GraphQuery,
    schema: &GraphSchema,
    removed: &[&str],
    offset: usize,
) -> GraphQuery {
    for (index, role) in removed.iter().enumerate() {
        let index = index + offset;
        let rel_alias = format!("ur{index}");
        query = query
            .optional_match(Pattern::related(
                NodeRef::bound(USER_ALIAS),
                RelPattern::new(&rel_alias, &schema.membership_edge),
                NodeRef::constrained(
                    format!("r{index}"),
                    &schema.role_label,
                    single_prop("normalized_name", &role.to_uppercase()),
                ),
            ))
            .delete(vec![rel_alias]);
    }
    query
}

/// Full user update: scalar overwrite, then journaled removals, then merges.
/// Removals run first so a key removed and re-added in the same unit of work
/// ends present.
pub fn update_user(schema: &GraphSchema, user: &User) -> GraphQuery {
    let mut removed_claims = Vec::new();
    let mut removed_logins = Vec::new();
    let mut removed_roles = Vec::new();
    for entity in user.removed() {
        match entity {
            RemovedEntity::Claim(claim) => removed_claims.push(claim),
            RemovedEntity::Login(login) => removed_logins.push(login),
            RemovedEntity::Role(role) => removed_roles.push(role.as_str()),
        }
    }

    let mut query = match_user_by_id(schema, user.id())
        .set(USER_ALIAS, combine::user_properties(user));
    query = remove_claims(query, schema, USER_ALIAS, &removed_claims, user.claims().len());
    query = remove_logins(query, schema, &removed_logins, user.logins().len());
    query = remove_memberships(query, schema, &removed_roles, user.roles().len());
    query = merge_claims(query, schema, USER_ALIAS, user.claims());
    query = merge_logins(query, schema, user.logins());
    query = merge_memberships(query, schema, user.roles());
    query
}

pub fn update_role(schema: &GraphSchema, role: &Role) -> GraphQuery {
    let removed: Vec<&Claim> = role.removed_claims().iter().collect();

    let mut query = match_role_by_id(schema, role.id())
        .set(ROLE_ALIAS, combine::role_properties(role));
    query = remove_claims(query, schema, ROLE_ALIAS, &removed, role.claims().len());
    query = merge_claims(query, schema, ROLE_ALIAS, role.claims());
    query
}

/// Deletes the user, its owned claim and login nodes, and every incident
/// edge. Role nodes are shared and stay.
pub fn delete_user(schema: &GraphSchema, id: &str) -> GraphQuery {
    match_user_by_id(schema, id)
        .optional_match(Pattern::related(
            NodeRef::bound(USER_ALIAS),
            RelPattern::new("cr", &schema.claim_edge),
            NodeRef::labeled("c", &schema.claim_label),
        ))
        .optional_match(Pattern::related(
            NodeRef::bound(USER_ALIAS),
            RelPattern::new("lr", &schema.login_edge),
            NodeRef::labeled("l", &schema.login_label),
        ))
        .optional_match(Pattern::related(
            NodeRef::bound(USER_ALIAS),
            RelPattern::new("ur", &schema.membership_edge),
            NodeRef::labeled("m", &schema.role_label),
        ))
        .delete(vec![
            "cr".to_string(),
            "c".to_string(),
            "lr".to_string(),
            "l".to_string(),
            "ur".to_string(),
            USER_ALIAS.to_string(),
        ])
}

pub fn delete_role(schema: &GraphSchema, id: &str) -> GraphQuery {
    match_role_by_id(schema, id)
        .optional_match(Pattern::related(
            NodeRef::bound(ROLE_ALIAS),
            RelPattern::new("cr", &schema.claim_edge),
            NodeRef::labeled("c", &schema.claim_label),
        ))
        .delete(vec![
            "cr".to_string(),
            "c".to_string(),
            ROLE_ALIAS.to_string(),
        ])
}
