use crate::certificates::{self, CertificateStatus};
use crate::error::CoreError;
use crate::ipc::helpers::{get_bool, get_optional_str, get_required_str, run_read, run_write};
use crate::ipc::types::{AppState, Request};

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_read(state, req, |conn, actor| {
        let certificate_id = get_required_str(&req.params, "certificateId")?;
        certificates::get_certificate(conn, actor, &certificate_id)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_read(state, req, |conn, actor| {
        let status = match get_optional_str(&req.params, "status")? {
            None => None,
            Some(raw) => Some(CertificateStatus::parse(raw.trim()).ok_or_else(|| {
                CoreError::bad_params(
                    "status must be one of: pending_attestation, pending_seal, issued",
                )
            })?),
        };
        certificates::list_certificates(conn, actor, status)
    })
}

fn handle_attest(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let certificate_id = get_required_str(&req.params, "certificateId")?;
        // blank numbers are rejected as validation errors, not bad params
        let number = get_optional_str(&req.params, "certificateNumber")?.unwrap_or_default();
        certificates::attest(conn, actor, &certificate_id, &number)
    })
}

fn handle_seal(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let certificate_id = get_required_str(&req.params, "certificateId")?;
        certificates::seal(conn, actor, &certificate_id)
    })
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let certificate_id = get_required_str(&req.params, "certificateId")?;
        let confirm = get_bool(&req.params, "confirmIssued")?;
        certificates::delete_certificate(conn, actor, &certificate_id, confirm)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "certificates.get" => Some(handle_get(state, req)),
        "certificates.list" => Some(handle_list(state, req)),
        "certificates.attest" => Some(handle_attest(state, req)),
        "certificates.seal" => Some(handle_seal(state, req)),
        "certificates.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
