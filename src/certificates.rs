//! Certificate approval pipeline:
//! `pending_attestation → pending_seal → issued`, each step taken by a
//! different authority. Back-entered certificates start out issued.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::{require_capability, require_role, Actor, Capability, Role};
use crate::catalog;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::notify::{Dispatch, Email, Notification, Outcome};

/// Shown in place of a number for back-entered certificates issued without one.
pub const BACKENTERED_NUMBER_PLACEHOLDER: &str = "back-entered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    PendingAttestation,
    PendingSeal,
    Issued,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CertificateStatus::PendingAttestation => "pending_attestation",
            CertificateStatus::PendingSeal => "pending_seal",
            CertificateStatus::Issued => "issued",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending_attestation" => Some(CertificateStatus::PendingAttestation),
            "pending_seal" => Some(CertificateStatus::PendingSeal),
            "issued" => Some(CertificateStatus::Issued),
            _ => None,
        }
    }
}

impl FromSql for CertificateStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        CertificateStatus::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown certificate status {raw}").into()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub status: CertificateStatus,
    pub certificate_number: Option<String>,
    pub display_number: Option<String>,
    pub is_backentered: bool,
    pub attested_by: Option<String>,
    pub attested_at: Option<String>,
    pub sealed_by: Option<String>,
    pub sealed_at: Option<String>,
    pub issued_at: Option<String>,
    pub created_at: String,
}

const CERTIFICATE_COLUMNS: &str = "id, student_id, course_id, status, certificate_number,
     is_backentered, attested_by, attested_at, sealed_by, sealed_at, issued_at, created_at";

fn certificate_from_row(r: &Row<'_>) -> rusqlite::Result<Certificate> {
    let certificate_number: Option<String> = r.get(4)?;
    let is_backentered = r.get::<_, i64>(5)? != 0;
    let display_number = match (&certificate_number, is_backentered) {
        (Some(n), _) => Some(n.clone()),
        (None, true) => Some(BACKENTERED_NUMBER_PLACEHOLDER.to_string()),
        (None, false) => None,
    };
    Ok(Certificate {
        id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        status: r.get(3)?,
        certificate_number,
        display_number,
        is_backentered,
        attested_by: r.get(6)?,
        attested_at: r.get(7)?,
        sealed_by: r.get(8)?,
        sealed_at: r.get(9)?,
        issued_at: r.get(10)?,
        created_at: r.get(11)?,
    })
}

pub fn load_certificate(conn: &Connection, certificate_id: &str) -> CoreResult<Certificate> {
    let sql = format!("SELECT {} FROM certificates WHERE id = ?", CERTIFICATE_COLUMNS);
    conn.query_row(&sql, [certificate_id], certificate_from_row)
        .optional()?
        .ok_or_else(|| CoreError::not_found("certificate", certificate_id))
}

pub fn find_certificate(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> CoreResult<Option<Certificate>> {
    let sql = format!(
        "SELECT {} FROM certificates WHERE student_id = ? AND course_id = ?",
        CERTIFICATE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, (student_id, course_id), certificate_from_row)
        .optional()?)
}

fn stored_certificate(conn: &Connection, student_id: &str, course_id: &str) -> CoreResult<Certificate> {
    find_certificate(conn, student_id, course_id)?
        .ok_or_else(|| CoreError::not_found("certificate", format!("{student_id}/{course_id}")))
}

/// Normal path: a fresh certificate awaiting attestation. Returns the stored
/// row and whether this call created it; an existing row is left untouched.
pub fn create_pending(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> CoreResult<(Certificate, bool)> {
    let inserted = conn.execute(
        "INSERT INTO certificates(id, student_id, course_id, status, is_backentered, created_at)
         VALUES(?, ?, ?, 'pending_attestation', 0, ?)
         ON CONFLICT(student_id, course_id) DO NOTHING",
        (db::new_id(), student_id, course_id, db::now_stamp()),
    )?;
    let cert = stored_certificate(conn, student_id, course_id)?;
    if inserted > 0 {
        info!(certificate_id = %cert.id, student_id, course_id, "certificate awaiting attestation");
    }
    Ok((cert, inserted > 0))
}

/// Back-entry path: created directly as issued, no approvals, no number
/// unless one is supplied.
pub fn create_backentered(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    certificate_number: Option<&str>,
    issued_at: &str,
) -> CoreResult<(Certificate, bool)> {
    let number = certificate_number.map(str::trim).filter(|n| !n.is_empty());
    let inserted = conn.execute(
        "INSERT INTO certificates(id, student_id, course_id, status, certificate_number,
                                  is_backentered, issued_at, created_at)
         VALUES(?, ?, ?, 'issued', ?, 1, ?, ?)
         ON CONFLICT(student_id, course_id) DO NOTHING",
        (
            db::new_id(),
            student_id,
            course_id,
            number,
            issued_at,
            db::now_stamp(),
        ),
    )?;
    let cert = stored_certificate(conn, student_id, course_id)?;
    if inserted > 0 {
        info!(certificate_id = %cert.id, student_id, course_id, "back-entered certificate issued");
    }
    Ok((cert, inserted > 0))
}

pub fn remove_certificate(conn: &Connection, certificate_id: &str) -> CoreResult<()> {
    conn.execute("DELETE FROM certificates WHERE id = ?", [certificate_id])?;
    Ok(())
}

fn require_certificate_reader(actor: &Actor) -> CoreResult<()> {
    if actor.is_admin() || actor.has(Capability::Attest) || actor.has(Capability::Seal) {
        return Ok(());
    }
    Err(CoreError::not_authorized(
        "certificate queues require admin role or an approval authority",
    ))
}

pub fn get_certificate(conn: &Connection, actor: &Actor, certificate_id: &str) -> CoreResult<Outcome> {
    let cert = load_certificate(conn, certificate_id)?;
    if !(actor.role == Role::Student && actor.id == cert.student_id) {
        require_certificate_reader(actor)?;
    }
    Ok(Outcome::silent(json!({ "certificate": cert })))
}

pub fn list_certificates(
    conn: &Connection,
    actor: &Actor,
    status: Option<CertificateStatus>,
) -> CoreResult<Outcome> {
    require_certificate_reader(actor)?;
    let sql = format!(
        "SELECT {} FROM certificates
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY created_at, id",
        CERTIFICATE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([status.map(CertificateStatus::as_str)], certificate_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Outcome::silent(json!({ "certificates": rows })))
}

pub fn attest(
    conn: &Connection,
    actor: &Actor,
    certificate_id: &str,
    certificate_number: &str,
) -> CoreResult<Outcome> {
    require_capability(actor, Capability::Attest)?;
    let cert = load_certificate(conn, certificate_id)?;
    if cert.status != CertificateStatus::PendingAttestation {
        return Err(CoreError::invalid_state(
            "certificate is not awaiting attestation",
            Some(cert.status.as_str()),
        ));
    }
    let number = certificate_number.trim();
    if number.is_empty() {
        return Err(CoreError::validation("certificate number is required"));
    }
    conn.execute(
        "UPDATE certificates
         SET status = 'pending_seal', certificate_number = ?, attested_by = ?, attested_at = ?
         WHERE id = ?",
        (number, &actor.id, db::now_stamp(), &cert.id),
    )?;
    info!(certificate_id = %cert.id, attested_by = %actor.id, number, "certificate attested");
    Ok(Outcome::silent(json!({
        "certificate": load_certificate(conn, &cert.id)?
    })))
}

pub fn seal(conn: &Connection, actor: &Actor, certificate_id: &str) -> CoreResult<Outcome> {
    require_capability(actor, Capability::Seal)?;
    let cert = load_certificate(conn, certificate_id)?;
    if cert.status != CertificateStatus::PendingSeal {
        return Err(CoreError::invalid_state(
            "certificate is not awaiting the seal",
            Some(cert.status.as_str()),
        ));
    }
    if cert.attested_by.as_deref() == Some(actor.id.as_str()) {
        return Err(CoreError::not_authorized(
            "the attesting officer cannot also seal the certificate",
        ));
    }
    let now = db::now_stamp();
    conn.execute(
        "UPDATE certificates
         SET status = 'issued', sealed_by = ?, sealed_at = ?, issued_at = ?
         WHERE id = ?",
        (&actor.id, &now, &now, &cert.id),
    )?;
    info!(certificate_id = %cert.id, sealed_by = %actor.id, "certificate issued");

    let issued = load_certificate(conn, &cert.id)?;
    let dispatches = completion_dispatches(conn, &issued)?;
    Ok(Outcome {
        result: json!({ "certificate": issued }),
        dispatches,
    })
}

fn completion_dispatches(conn: &Connection, cert: &Certificate) -> CoreResult<Vec<Dispatch>> {
    let student = catalog::load_user(conn, &cert.student_id)?;
    let course = catalog::load_course(conn, &cert.course_id)?;
    let next = catalog::next_course_in_category(conn, &course)?;

    let title = format!("Course completed: {}", course.title);
    let mut message = format!(
        "Your certificate for \"{}\" has been issued.",
        course.title
    );
    let link = match &next {
        Some(next) => {
            message.push_str(&format!(" Continue with \"{}\".", next.title));
            Some(format!("/courses/{}", next.id))
        }
        None => Some(format!("/certificates/{}", cert.id)),
    };

    let mut out = vec![Dispatch::Notify(Notification {
        user_id: student.id.clone(),
        kind: "course_completed",
        title: title.clone(),
        message: message.clone(),
        link: link.clone(),
    })];
    if let Some(email) = student.email {
        out.push(Dispatch::Email(Email {
            to: email,
            subject: title,
            body: message,
            link,
        }));
    }
    Ok(out)
}

/// Admin removal. An issued certificate needs `confirm_issued`.
pub fn delete_certificate(
    conn: &Connection,
    actor: &Actor,
    certificate_id: &str,
    confirm_issued: bool,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let cert = load_certificate(conn, certificate_id)?;
    if cert.status == CertificateStatus::Issued && !confirm_issued {
        return Err(CoreError::validation(
            "certificate is already issued; pass confirmIssued to delete it",
        ));
    }
    remove_certificate(conn, &cert.id)?;
    if cert.status == CertificateStatus::Issued {
        warn!(certificate_id = %cert.id, student_id = %cert.student_id, course_id = %cert.course_id, "issued certificate deleted");
    } else {
        info!(certificate_id = %cert.id, "certificate deleted");
    }
    Ok(Outcome::silent(json!({
        "deleted": true,
        "certificateId": cert.id,
        "wasIssued": cert.status == CertificateStatus::Issued,
    })))
}
