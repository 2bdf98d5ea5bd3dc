use anyhow::anyhow;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// A timestamp-or-absent value object. Absent is a valid state distinct from
/// any concrete instant; once constructed the value never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Occurrence {
    instant: Option<DateTime<Utc>>,
}

impl Occurrence {
    pub fn now() -> Self {
        Self {
            instant: Some(Utc::now()),
        }
    }

    pub const fn absent() -> Self {
        Self { instant: None }
    }

    pub const fn at(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    pub const fn from_instant(instant: Option<DateTime<Utc>>) -> Self {
        Self { instant }
    }

    pub const fn instant(&self) -> Option<DateTime<Utc>> {
        self.instant
    }

    pub const fn is_set(&self) -> bool {
        self.instant.is_some()
    }
}

/// Raw contact value (email address or phone number) paired with its
/// normalized form and a confirmation marker. Used for both the email and
/// phone fields of a [`User`]; the owning field determines the kind.
#[derive(Debug, Clone, Default)]
pub struct ContactRecord {
    pub(crate) value: Option<String>,
    pub(crate) normalized_value: Option<String>,
    pub(crate) confirmed_on: Occurrence,
}

impl ContactRecord {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            normalized_value: None,
            confirmed_on: Occurrence::absent(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn normalized_value(&self) -> Option<&str> {
        self.normalized_value.as_deref()
    }

    pub fn set_normalized(&mut self, normalized: impl Into<String>) {
        self.normalized_value = Some(normalized.into());
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed_on.is_set()
    }

    pub fn confirmed_on(&self) -> Occurrence {
        self.confirmed_on
    }

    /// First confirmation wins: confirming an already confirmed record keeps
    /// the original instant.
    pub fn set_confirmed(&mut self) {
        self.set_confirmed_at(Occurrence::now());
    }

    pub fn set_confirmed_at(&mut self, confirmed_on: Occurrence) {
        if !self.confirmed_on.is_set() {
            self.confirmed_on = confirmed_on;
        }
    }

    pub fn set_unconfirmed(&mut self) {
        self.confirmed_on = Occurrence::absent();
    }
}

// Display/diagnostic comparison only; graph matching never uses this.
impl PartialEq for ContactRecord {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

/// A type/value pair owned by a user or role. Natural key is
/// `(claim_type, value)`; equality follows the natural key.
#[derive(Debug, Clone)]
pub struct Claim {
    pub(crate) claim_type: String,
    pub(crate) value: String,
    pub(crate) created_on: Occurrence,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let claim_type = claim_type.into();
        if claim_type.trim().is_empty() {
            return Err(StoreError::invalid(
                "Claim type is required",
                anyhow!("empty claim type"),
            ));
        }
        Ok(Self {
            claim_type,
            value: value.into(),
            created_on: Occurrence::now(),
        })
    }

    pub fn claim_type(&self) -> &str {
        &self.claim_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn created_on(&self) -> Occurrence {
        self.created_on
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.claim_type, &self.value)
    }
}

impl PartialEq for Claim {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Claim {}

/// A federated-login identity. Natural key is `(login_provider,
/// provider_key)`; the display name carries no identity.
#[derive(Debug, Clone)]
pub struct ExternalLogin {
    pub(crate) login_provider: String,
    pub(crate) provider_key: String,
    pub(crate) provider_display_name: Option<String>,
    pub(crate) created_on: Occurrence,
}

impl ExternalLogin {
    pub fn new(
        login_provider: impl Into<String>,
        provider_key: impl Into<String>,
        provider_display_name: Option<String>,
    ) -> Self {
        Self {
            login_provider: login_provider.into(),
            provider_key: provider_key.into(),
            provider_display_name,
            created_on: Occurrence::now(),
        }
    }

    pub fn login_provider(&self) -> &str {
        &self.login_provider
    }

    pub fn provider_key(&self) -> &str {
        &self.provider_key
    }

    pub fn provider_display_name(&self) -> Option<&str> {
        self.provider_display_name.as_deref()
    }

    pub fn created_on(&self) -> Occurrence {
        self.created_on
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.login_provider, &self.provider_key)
    }
}

impl PartialEq for ExternalLogin {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ExternalLogin {}

// Same folding the membership merge uses to match role nodes, so in-memory
// role checks and graph matches agree on non-ASCII names.
fn same_role_name(a: &str, b: &str) -> bool {
    a.to_uppercase() == b.to_uppercase()
}

/// A sub-entity detached from an aggregate since it was loaded. Collected in
/// an append-only journal so the next update can propagate the deletions.
#[derive(Debug, Clone, PartialEq)]
pub enum RemovedEntity {
    Claim(Claim),
    Login(ExternalLogin),
    Role(String),
}

/// The user aggregate root: scalar identity state plus owned claim, login,
/// and role-membership collections and the removal journal.
#[derive(Debug, Clone)]
pub struct User {
    pub(crate) id: String,
    pub(crate) user_name: Option<String>,
    pub(crate) normalized_user_name: Option<String>,
    pub(crate) email: ContactRecord,
    pub(crate) phone_number: ContactRecord,
    pub(crate) password_hash: Option<String>,
    pub(crate) security_stamp: Option<String>,
    pub(crate) two_factor_enabled: bool,
    pub(crate) lockout_enabled: bool,
    pub(crate) access_failed_count: u32,
    pub(crate) lockout_end: Occurrence,
    pub(crate) created_on: Occurrence,
    pub(crate) claims: Vec<Claim>,
    pub(crate) logins: Vec<ExternalLogin>,
    pub(crate) roles: Vec<String>,
    pub(crate) removed: Vec<RemovedEntity>,
}

impl User {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            id: format!("user_{}", Uuid::new_v4().simple()),
            user_name: Some(user_name.into()),
            normalized_user_name: None,
            email: ContactRecord::empty(),
            phone_number: ContactRecord::empty(),
            password_hash: None,
            security_stamp: None,
            two_factor_enabled: false,
            lockout_enabled: false,
            access_failed_count: 0,
            lockout_end: Occurrence::absent(),
            created_on: Occurrence::now(),
            claims: Vec::new(),
            logins: Vec::new(),
            roles: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn with_email(user_name: impl Into<String>, email: impl Into<String>) -> Self {
        let mut user = Self::new(user_name);
        user.email = ContactRecord::new(email);
        user
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn normalized_user_name(&self) -> Option<&str> {
        self.normalized_user_name.as_deref()
    }

    pub fn email(&self) -> &ContactRecord {
        &self.email
    }

    pub fn email_mut(&mut self) -> &mut ContactRecord {
        &mut self.email
    }

    pub fn phone_number(&self) -> &ContactRecord {
        &self.phone_number
    }

    pub fn phone_number_mut(&mut self) -> &mut ContactRecord {
        &mut self.phone_number
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    pub fn security_stamp(&self) -> Option<&str> {
        self.security_stamp.as_deref()
    }

    pub fn two_factor_enabled(&self) -> bool {
        self.two_factor_enabled
    }

    pub fn lockout_enabled(&self) -> bool {
        self.lockout_enabled
    }

    pub fn access_failed_count(&self) -> u32 {
        self.access_failed_count
    }

    pub fn lockout_end(&self) -> Occurrence {
        self.lockout_end
    }

    pub fn created_on(&self) -> Occurrence {
        self.created_on
    }

    pub fn set_user_name(&mut self, user_name: impl Into<String>) {
        self.user_name = Some(user_name.into());
    }

    pub fn set_normalized_user_name(&mut self, normalized: impl Into<String>) {
        self.normalized_user_name = Some(normalized.into());
    }

    pub fn set_email(&mut self, email: ContactRecord) {
        self.email = email;
    }

    pub fn set_phone_number(&mut self, phone_number: ContactRecord) {
        self.phone_number = phone_number;
    }

    pub fn set_password_hash(&mut self, password_hash: Option<String>) {
        self.password_hash = password_hash;
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    pub fn set_security_stamp(&mut self, security_stamp: Option<String>) {
        self.security_stamp = security_stamp;
    }

    pub fn set_two_factor_enabled(&mut self, enabled: bool) {
        self.two_factor_enabled = enabled;
    }

    pub fn set_lockout_enabled(&mut self, enabled: bool) {
        self.lockout_enabled = enabled;
    }

    pub fn set_access_failed_count(&mut self, count: u32) {
        self.access_failed_count = count;
    }

    pub fn increment_access_failed_count(&mut self) -> u32 {
        self.access_failed_count += 1;
        self.access_failed_count
    }

    pub fn reset_access_failed_count(&mut self) {
        self.access_failed_count = 0;
    }

    pub fn lock_until(&mut self, lockout_end: Occurrence) {
        self.lockout_end = lockout_end;
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Adds a claim unless one with the same natural key is already present.
    pub fn add_claim(&mut self, claim: Claim) {
        if !self.claims.iter().any(|existing| *existing == claim) {
            self.claims.push(claim);
        }
    }

    /// Detaches the claim with the given natural key and journals it for the
    /// next update. Returns whether anything was removed.
    pub fn remove_claim(&mut self, claim_type: &str, value: &str) -> bool {
        let Some(position) = self
            .claims
            .iter()
            .position(|claim| claim.key() == (claim_type, value))
        else {
            return false;
        };
        let claim = self.claims.remove(position);
        self.removed.push(RemovedEntity::Claim(claim));
        true
    }

    /// Swaps the claim with the given natural key for `replacement`: the old
    /// claim is journaled, the new one attached. Returns whether a swap
    /// happened.
    pub fn replace_claim(&mut self, claim_type: &str, value: &str, replacement: Claim) -> bool {
        if !self.remove_claim(claim_type, value) {
            return false;
        }
        self.add_claim(replacement);
        true
    }

    pub fn logins(&self) -> &[ExternalLogin] {
        &self.logins
    }

    pub fn add_login(&mut self, login: ExternalLogin) {
        if !self.logins.iter().any(|existing| *existing == login) {
            self.logins.push(login);
        }
    }

    pub fn remove_login(&mut self, login_provider: &str, provider_key: &str) -> bool {
        let Some(position) = self
            .logins
            .iter()
            .position(|login| login.key() == (login_provider, provider_key))
        else {
            return false;
        };
        let login = self.logins.remove(position);
        self.removed.push(RemovedEntity::Login(login));
        true
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Adds a role-name reference unless one already matches
    /// case-insensitively. Pure in-memory mutation; persisted by the next
    /// update.
    pub fn add_role(&mut self, role: impl Into<String>) -> Result<()> {
        let role = role.into();
        if role.trim().is_empty() {
            return Err(StoreError::invalid(
                "Role name is required",
                anyhow!("blank role name"),
            ));
        }
        if !self.has_role(&role) {
            self.roles.push(role);
        }
        Ok(())
    }

    pub fn remove_role(&mut self, role: &str) -> bool {
        let Some(position) = self
            .roles
            .iter()
            .position(|existing| same_role_name(existing, role))
        else {
            return false;
        };
        let removed = self.roles.remove(position);
        self.removed.push(RemovedEntity::Role(removed));
        true
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|existing| same_role_name(existing, role))
    }

    pub fn removed(&self) -> &[RemovedEntity] {
        &self.removed
    }

    /// Clears the removal journal. Called by the owner once an update has
    /// persisted the removals; the store never calls this itself.
    pub fn mark_persisted(&mut self) {
        self.removed.clear();
    }

    // Reconstruction path used by the result combiner: attaching never
    // touches the removal journal.
    pub(crate) fn attach_claim(&mut self, claim: Claim) {
        if !self.claims.iter().any(|existing| *existing == claim) {
            self.claims.push(claim);
        }
    }

    pub(crate) fn attach_login(&mut self, login: ExternalLogin) {
        if !self.logins.iter().any(|existing| *existing == login) {
            self.logins.push(login);
        }
    }

    pub(crate) fn attach_role(&mut self, role: String) {
        if !self.has_role(&role) {
            self.roles.push(role);
        }
    }
}

/// The role aggregate root. Equality is by normalized name.
#[derive(Debug, Clone)]
pub struct Role {
    pub(crate) id: String,
    pub(crate) name: Option<String>,
    pub(crate) normalized_name: Option<String>,
    pub(crate) concurrency_stamp: Option<String>,
    pub(crate) created_on: Occurrence,
    pub(crate) claims: Vec<Claim>,
    pub(crate) removed_claims: Vec<Claim>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: format!("role_{}", Uuid::new_v4().simple()),
            name: Some(name.into()),
            normalized_name: None,
            concurrency_stamp: Some(Uuid::new_v4().to_string()),
            created_on: Occurrence::now(),
            claims: Vec::new(),
            removed_claims: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn normalized_name(&self) -> Option<&str> {
        self.normalized_name.as_deref()
    }

    pub fn concurrency_stamp(&self) -> Option<&str> {
        self.concurrency_stamp.as_deref()
    }

    pub fn created_on(&self) -> Occurrence {
        self.created_on
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn set_normalized_name(&mut self, normalized: impl Into<String>) {
        self.normalized_name = Some(normalized.into());
    }

    /// Caller-supplied state; the store copies it verbatim on writes and
    /// never regenerates it.
    pub fn set_concurrency_stamp(&mut self, stamp: Option<String>) {
        self.concurrency_stamp = stamp;
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn add_claim(&mut self, claim: Claim) {
        if !self.claims.iter().any(|existing| *existing == claim) {
            self.claims.push(claim);
        }
    }

    pub fn remove_claim(&mut self, claim_type: &str, value: &str) -> bool {
        let Some(position) = self
            .claims
            .iter()
            .position(|claim| claim.key() == (claim_type, value))
        else {
            return false;
        };
        let claim = self.claims.remove(position);
        self.removed_claims.push(claim);
        true
    }

    pub fn removed_claims(&self) -> &[Claim] {
        &self.removed_claims
    }

    pub fn mark_persisted(&mut self) {
        self.removed_claims.clear();
    }

    pub(crate) fn attach_claim(&mut self, claim: Claim) {
        if !self.claims.iter().any(|existing| *existing == claim) {
            self.claims.push(claim);
        }
    }
}

impl PartialEq for Role {
    fn eq(&self, other: &Self) -> bool {
        match (&self.normalized_name, &other.normalized_name) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn occurrence_absent_is_distinct_from_set() {
        let absent = Occurrence::absent();
        assert!(!absent.is_set());
        assert_eq!(absent.instant(), None);

        let instant = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let set = Occurrence::at(instant);
        assert!(set.is_set());
        assert_eq!(set.instant(), Some(instant));
        assert_ne!(absent, set);
    }

    #[test]
    fn contact_record_first_confirmation_wins() {
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let mut record = ContactRecord::new("a@x.com");
        assert!(!record.is_confirmed());

        record.set_confirmed_at(Occurrence::at(first));
        record.set_confirmed_at(Occurrence::at(second));
        assert_eq!(record.confirmed_on().instant(), Some(first));
    }

    #[test]
    fn contact_record_unconfirm_resets_to_absent() {
        let mut record = ContactRecord::new("a@x.com");
        record.set_confirmed();
        assert!(record.is_confirmed());

        record.set_unconfirmed();
        assert!(!record.is_confirmed());

        record.set_confirmed();
        assert!(record.is_confirmed());
    }

    #[test]
    fn claim_requires_type() {
        let err = Claim::new("  ", "v").expect_err("blank type should fail");
        assert_eq!(err.code, "invalid_argument");
    }

    #[test]
    fn claim_equality_follows_natural_key() {
        let a = Claim::new("scope", "read").expect("valid claim");
        let b = Claim::new("scope", "read").expect("valid claim");
        let c = Claim::new("scope", "write").expect("valid claim");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn login_equality_ignores_display_name() {
        let a = ExternalLogin::new("github", "key-1", Some("GitHub".to_string()));
        let b = ExternalLogin::new("github", "key-1", None);
        assert_eq!(a, b);
    }

    #[test]
    fn user_claims_are_unique_by_natural_key() {
        let mut user = User::new("alice");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        assert_eq!(user.claims().len(), 1);
    }

    #[test]
    fn removing_a_claim_journals_it() {
        let mut user = User::new("alice");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));

        assert!(user.remove_claim("scope", "read"));
        assert!(user.claims().is_empty());
        assert_eq!(user.removed().len(), 1);

        // Unknown keys neither remove nor journal.
        assert!(!user.remove_claim("scope", "read"));
        assert_eq!(user.removed().len(), 1);
    }

    #[test]
    fn replace_claim_journals_old_and_attaches_new() {
        let mut user = User::new("alice");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));

        let replacement = Claim::new("scope", "write").expect("valid claim");
        assert!(user.replace_claim("scope", "read", replacement));
        assert_eq!(user.claims().len(), 1);
        assert_eq!(user.claims()[0].value(), "write");
        assert!(matches!(
            &user.removed()[0],
            RemovedEntity::Claim(claim) if claim.value() == "read"
        ));

        assert!(!user.replace_claim("scope", "missing", Claim::new("scope", "x").expect("valid claim")));
    }

    #[test]
    fn mark_persisted_clears_the_journal() {
        let mut user = User::new("alice");
        user.add_claim(Claim::new("scope", "read").expect("valid claim"));
        user.remove_claim("scope", "read");
        assert!(!user.removed().is_empty());

        user.mark_persisted();
        assert!(user.removed().is_empty());
    }

    #[test]
    fn roles_are_case_insensitive() {
        let mut user = User::new("alice");
        user.add_role("Admin").expect("valid role");
        user.add_role("ADMIN").expect("valid role");
        assert_eq!(user.roles().len(), 1);
        assert!(user.has_role("admin"));

        assert!(user.remove_role("aDmIn"));
        assert!(user.roles().is_empty());
        assert!(matches!(&user.removed()[0], RemovedEntity::Role(name) if name == "Admin"));
    }

    #[test]
    fn role_folding_handles_non_ascii_names() {
        let mut user = User::new("alice");
        user.add_role("Ädmin").expect("valid role");
        user.add_role("ÄDMIN").expect("valid role");
        assert_eq!(user.roles().len(), 1);
        assert!(user.has_role("ädmin"));
        assert!(user.remove_role("ÄDMIN"));
        assert!(user.roles().is_empty());
    }

    #[test]
    fn blank_role_is_rejected() {
        let mut user = User::new("alice");
        let err = user.add_role("   ").expect_err("blank role should fail");
        assert_eq!(err.code, "invalid_argument");
    }

    #[test]
    fn attach_does_not_journal() {
        let mut user = User::new("alice");
        user.attach_claim(Claim::new("scope", "read").expect("valid claim"));
        user.attach_role("Admin".to_string());
        assert!(user.removed().is_empty());
        assert_eq!(user.claims().len(), 1);
        assert!(user.has_role("admin"));
    }

    #[test]
    fn generated_ids_carry_entity_prefix() {
        assert!(User::new("alice").id().starts_with("user_"));
        assert!(Role::new("admin").id().starts_with("role_"));
    }

    #[test]
    fn role_equality_by_normalized_name() {
        let mut a = Role::new("Admin");
        let mut b = Role::new("admin");
        assert_ne!(a, b);

        a.set_normalized_name("ADMIN");
        b.set_normalized_name("ADMIN");
        assert_eq!(a, b);
    }
}
