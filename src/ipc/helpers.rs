use rusqlite::Connection;
use tracing::{debug, warn};

use crate::auth::{self, Actor};
use crate::config::NotificationMode;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::ipc::error::{no_workspace, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, LogOnlyNotifier, Outcome, OutboxNotifier};

pub fn get_required_str(params: &serde_json::Value, key: &str) -> CoreResult<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> CoreResult<Option<String>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| CoreError::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> CoreResult<Option<i64>> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| CoreError::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_bool(params: &serde_json::Value, key: &str) -> CoreResult<bool> {
    match params.get(key) {
        None => Ok(false),
        Some(v) if v.is_null() => Ok(false),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| CoreError::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn get_str_array(params: &serde_json::Value, key: &str) -> CoreResult<Vec<String>> {
    let Some(items) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(CoreError::bad_params(format!("missing {}", key)));
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| CoreError::bad_params(format!("{} must contain strings", key)))
        })
        .collect()
}

fn reject(req: &Request, e: CoreError) -> serde_json::Value {
    match &e {
        CoreError::Db(inner) => warn!(method = %req.method, error = %inner, "request failed"),
        other => debug!(method = %req.method, code = other.code(), "request rejected"),
    }
    e.response(&req.id)
}

/// Read-only operation: no transaction, nothing dispatched.
pub fn run_read<F>(state: &AppState, req: &Request, op: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &Actor) -> CoreResult<Outcome>,
{
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let result = auth::actor_from_params(&req.params).and_then(|actor| op(conn, &actor));
    match result {
        Ok(outcome) => ok(&req.id, outcome.result),
        Err(e) => reject(req, e),
    }
}

/// Mutating operation: runs in one write transaction, committed only on
/// success. Dispatches go out after the commit and cannot fail the request.
pub fn run_write<F>(state: &AppState, req: &Request, op: F) -> serde_json::Value
where
    F: FnOnce(&Connection, &Actor) -> CoreResult<Outcome>,
{
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let actor = match auth::actor_from_params(&req.params) {
        Ok(a) => a,
        Err(e) => return reject(req, e),
    };
    let result = db::begin_write(conn)
        .map_err(CoreError::from)
        .and_then(|tx| {
            let outcome = op(&*tx, &actor)?;
            tx.commit()?;
            Ok(outcome)
        });
    let outcome = match result {
        Ok(o) => o,
        Err(e) => return reject(req, e),
    };

    if !outcome.dispatches.is_empty() {
        let base_url = state.config.public_base_url.as_str();
        match state.config.notifications {
            NotificationMode::Outbox => {
                notify::dispatch_all(&OutboxNotifier::new(conn), outcome.dispatches, base_url);
            }
            NotificationMode::Off => {
                notify::dispatch_all(&LogOnlyNotifier, outcome.dispatches, base_url);
            }
        }
    }
    ok(&req.id, outcome.result)
}
