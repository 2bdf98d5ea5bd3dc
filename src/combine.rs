//! Folds flattened query results (one root node plus collected relationship
//! collections) back into aggregates, and converts aggregates into the
//! property bags the mapping layer writes. Reconstruction goes through the
//! aggregates' bulk-attach path, so it never touches removal journals.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::mapping;
use crate::models::{Claim, ContactRecord, ExternalLogin, Occurrence, Role, User};
use crate::query::{Properties, Row};

fn to_properties<T: Serialize>(value: &T) -> Properties {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => Properties::new(),
    }
}

fn from_properties<T: DeserializeOwned>(props: &Properties, what: &'static str) -> Result<T> {
    let value = Value::Object(props.clone().into_iter().collect());
    serde_json::from_value(value).map_err(|err| {
        StoreError::unavailable(
            "Graph returned a malformed row",
            anyhow!("failed to decode {what}: {err}"),
        )
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRow {
    id: String,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    normalized_user_name: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    normalized_email: Option<String>,
    #[serde(default)]
    email_confirmed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    normalized_phone_number: Option<String>,
    #[serde(default)]
    phone_confirmed_on: Option<DateTime<Utc>>,
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    security_stamp: Option<String>,
    #[serde(default)]
    two_factor_enabled: bool,
    #[serde(default)]
    lockout_enabled: bool,
    #[serde(default)]
    access_failed_count: i64,
    #[serde(default)]
    lockout_end: Option<DateTime<Utc>>,
    #[serde(default)]
    created_on: Option<DateTime<Utc>>,
}

impl From<&User> for UserRow {
    fn from(user: &User) -> Self {
        Self {
            id: user.id().to_string(),
            user_name: user.user_name().map(str::to_string),
            normalized_user_name: user.normalized_user_name().map(str::to_string),
            email: user.email().value().map(str::to_string),
            normalized_email: user.email().normalized_value().map(str::to_string),
            email_confirmed_on: user.email().confirmed_on().instant(),
            phone_number: user.phone_number().value().map(str::to_string),
            normalized_phone_number: user.phone_number().normalized_value().map(str::to_string),
            phone_confirmed_on: user.phone_number().confirmed_on().instant(),
            password_hash: user.password_hash().map(str::to_string),
            security_stamp: user.security_stamp().map(str::to_string),
            two_factor_enabled: user.two_factor_enabled(),
            lockout_enabled: user.lockout_enabled(),
            access_failed_count: i64::from(user.access_failed_count()),
            lockout_end: user.lockout_end().instant(),
            created_on: user.created_on().instant(),
        }
    }
}

impl UserRow {
    fn into_user(self) -> User {
        User {
            id: self.id,
            user_name: self.user_name,
            normalized_user_name: self.normalized_user_name,
            email: ContactRecord {
                value: self.email,
                normalized_value: self.normalized_email,
                confirmed_on: Occurrence::from_instant(self.email_confirmed_on),
            },
            phone_number: ContactRecord {
                value: self.phone_number,
                normalized_value: self.normalized_phone_number,
                confirmed_on: Occurrence::from_instant(self.phone_confirmed_on),
            },
            password_hash: self.password_hash,
            security_stamp: self.security_stamp,
            two_factor_enabled: self.two_factor_enabled,
            lockout_enabled: self.lockout_enabled,
            access_failed_count: u32::try_from(self.access_failed_count.max(0)).unwrap_or(0),
            lockout_end: Occurrence::from_instant(self.lockout_end),
            created_on: Occurrence::from_instant(self.created_on),
            claims: Vec::new(),
            logins: Vec::new(),
            roles: Vec::new(),
            removed: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ClaimRow {
    #[serde(rename = "type")]
    claim_type: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    created_on: Option<DateTime<Utc>>,
}

impl ClaimRow {
    fn into_claim(self) -> Claim {
        Claim {
            claim_type: self.claim_type,
            value: self.value,
            created_on: Occurrence::from_instant(self.created_on),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginRow {
    login_provider: String,
    provider_key: String,
    #[serde(default)]
    provider_display_name: Option<String>,
    #[serde(default)]
    created_on: Option<DateTime<Utc>>,
}

impl LoginRow {
    fn into_login(self) -> ExternalLogin {
        ExternalLogin {
            login_provider: self.login_provider,
            provider_key: self.provider_key,
            provider_display_name: self.provider_display_name,
            created_on: Occurrence::from_instant(self.created_on),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RoleRow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    normalized_name: Option<String>,
    #[serde(default)]
    concurrency_stamp: Option<String>,
    #[serde(default)]
    created_on: Option<DateTime<Utc>>,
}

impl From<&Role> for RoleRow {
    fn from(role: &Role) -> Self {
        Self {
            id: role.id().to_string(),
            name: role.name().map(str::to_string),
            normalized_name: role.normalized_name().map(str::to_string),
            concurrency_stamp: role.concurrency_stamp().map(str::to_string),
            created_on: role.created_on().instant(),
        }
    }
}

impl RoleRow {
    fn into_role(self) -> Role {
        Role {
            id: self.id,
            name: self.name,
            normalized_name: self.normalized_name,
            concurrency_stamp: self.concurrency_stamp,
            created_on: Occurrence::from_instant(self.created_on),
            claims: Vec::new(),
            removed_claims: Vec::new(),
        }
    }
}

pub(crate) fn user_properties(user: &User) -> Properties {
    to_properties(&UserRow::from(user))
}

pub(crate) fn role_properties(role: &Role) -> Properties {
    to_properties(&RoleRow::from(role))
}

pub(crate) fn claim_properties(claim: &Claim) -> Properties {
    to_properties(&ClaimRow {
        claim_type: claim.claim_type().to_string(),
        value: claim.value().to_string(),
        created_on: claim.created_on().instant(),
    })
}

/// Natural key only; used for merge/delete constraint matching.
pub(crate) fn claim_key_properties(claim: &Claim) -> Properties {
    let mut props = Properties::new();
    props.insert("type".to_string(), Value::String(claim.claim_type().to_string()));
    props.insert("value".to_string(), Value::String(claim.value().to_string()));
    props
}

pub(crate) fn login_properties(login: &ExternalLogin) -> Properties {
    to_properties(&LoginRow {
        login_provider: login.login_provider().to_string(),
        provider_key: login.provider_key().to_string(),
        provider_display_name: login.provider_display_name().map(str::to_string),
        created_on: login.created_on().instant(),
    })
}

pub(crate) fn login_key_properties(login: &ExternalLogin) -> Properties {
    let mut props = Properties::new();
    props.insert(
        "login_provider".to_string(),
        Value::String(login.login_provider().to_string()),
    );
    props.insert(
        "provider_key".to_string(),
        Value::String(login.provider_key().to_string()),
    );
    props
}

pub(crate) fn membership_properties() -> Properties {
    let mut props = Properties::new();
    if let Ok(created_on) = serde_json::to_value(Utc::now()) {
        props.insert("created_on".to_string(), created_on);
    }
    props
}

/// Combines a user root row with its collected claim, login, and role
/// collections. Deterministic for identical row content; collection order is
/// whatever the engine returned.
pub(crate) fn combine_user(row: &Row) -> Result<User> {
    let mut user = from_properties::<UserRow>(&row.root, "user node").map(UserRow::into_user)?;

    for props in row.collection(mapping::CLAIM_COLLECTION) {
        let claim = from_properties::<ClaimRow>(props, "claim node")?.into_claim();
        user.attach_claim(claim);
    }
    for props in row.collection(mapping::LOGIN_COLLECTION) {
        let login = from_properties::<LoginRow>(props, "login node")?.into_login();
        user.attach_login(login);
    }
    for props in row.collection(mapping::ROLE_COLLECTION) {
        let role = from_properties::<RoleRow>(props, "role node")?;
        if let Some(name) = role.name.or(role.normalized_name) {
            user.attach_role(name);
        }
    }

    Ok(user)
}

pub(crate) fn combine_role(row: &Row) -> Result<Role> {
    let mut role = from_properties::<RoleRow>(&row.root, "role node").map(RoleRow::into_role)?;

    for props in row.collection(mapping::CLAIM_COLLECTION) {
        let claim = from_properties::<ClaimRow>(props, "claim node")?.into_claim();
        role.attach_claim(claim);
    }

    Ok(role)
}
