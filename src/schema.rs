/// The graph entity variants the stores know how to map. New kinds extend
/// this enum and [`GraphSchema`] without touching the composition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Role,
    Claim,
    Login,
    /// The `(user)-[membership]->(role)` edge entity. Carries its own
    /// creation marker; it has an edge type but no node label.
    Membership,
}

/// Node labels and edge types used by the mapping layer, supplied explicitly
/// at store construction instead of through a process-wide registry.
#[derive(Debug, Clone)]
pub struct GraphSchema {
    pub user_label: String,
    pub role_label: String,
    pub claim_label: String,
    pub login_label: String,
    pub claim_edge: String,
    pub login_edge: String,
    pub membership_edge: String,
}

impl Default for GraphSchema {
    fn default() -> Self {
        Self {
            user_label: "IdentityUser".to_string(),
            role_label: "IdentityRole".to_string(),
            claim_label: "IdentityClaim".to_string(),
            login_label: "IdentityLogin".to_string(),
            claim_edge: "HAS_CLAIM".to_string(),
            login_edge: "HAS_LOGIN".to_string(),
            membership_edge: "IN_ROLE".to_string(),
        }
    }
}

impl GraphSchema {
    pub fn node_label(&self, kind: EntityKind) -> Option<&str> {
        match kind {
            EntityKind::User => Some(&self.user_label),
            EntityKind::Role => Some(&self.role_label),
            EntityKind::Claim => Some(&self.claim_label),
            EntityKind::Login => Some(&self.login_label),
            EntityKind::Membership => None,
        }
    }

    pub fn edge_type(&self, kind: EntityKind) -> Option<&str> {
        match kind {
            EntityKind::Claim => Some(&self.claim_edge),
            EntityKind::Login => Some(&self.login_edge),
            EntityKind::Membership => Some(&self.membership_edge),
            EntityKind::User | EntityKind::Role => None,
        }
    }
}
