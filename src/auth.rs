//! Caller identity as handed over by the identity layer, and the single
//! role/capability gate every operation passes through first.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Supervisor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Supervisor => "supervisor",
            Role::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "supervisor" => Some(Role::Supervisor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Role::parse(raw).ok_or_else(|| FromSqlError::Other(format!("unknown role {raw}").into()))
    }
}

/// Certificate approval authorities. Held independently of the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Attest,
    Seal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl Actor {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Reads `params.actor`. A missing or blank identity is `not_authenticated`;
/// a present but malformed one is `bad_params`.
pub fn actor_from_params(params: &serde_json::Value) -> CoreResult<Actor> {
    let raw = match params.get("actor") {
        None => return Err(CoreError::NotAuthenticated),
        Some(v) if v.is_null() => return Err(CoreError::NotAuthenticated),
        Some(v) => v.clone(),
    };
    let actor: Actor = serde_json::from_value(raw)
        .map_err(|e| CoreError::bad_params(format!("invalid actor: {}", e)))?;
    if actor.id.trim().is_empty() {
        return Err(CoreError::NotAuthenticated);
    }
    Ok(actor)
}

pub fn require_role(actor: &Actor, allowed: &[Role]) -> CoreResult<()> {
    if allowed.contains(&actor.role) {
        return Ok(());
    }
    let names: Vec<&str> = allowed.iter().map(|r| r.as_str()).collect();
    Err(CoreError::not_authorized(format!(
        "role {} may not perform this operation (requires {})",
        actor.role.as_str(),
        names.join("|")
    )))
}

pub fn require_capability(actor: &Actor, capability: Capability) -> CoreResult<()> {
    if actor.has(capability) {
        return Ok(());
    }
    let name = match capability {
        Capability::Attest => "attest",
        Capability::Seal => "seal",
    };
    Err(CoreError::not_authorized(format!(
        "missing {} authority",
        name
    )))
}
