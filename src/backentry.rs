//! Import of historical completions. Writes passed submissions (and, once
//! the course is complete, an issued certificate) directly, without grading
//! or notifications. Lessons that already have a submission are skipped, so
//! repeating an import is harmless.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use tracing::info;

use crate::auth::{require_role, Actor, Role};
use crate::catalog::{self, EnrollmentStatus};
use crate::certificates;
use crate::completion;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::notify::Outcome;

/// Stored as the answer text of every synthesized answer.
pub const PLACEHOLDER_ANSWER: &str = "Completed in a prior system.";

#[derive(Debug, Clone, Default)]
pub struct BackEntryRequest {
    pub student_id: String,
    pub course_id: String,
    pub completed_at: Option<String>,
    pub certificate_number: Option<String>,
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or RFC 3339.
pub fn parse_historical_date(raw: &str) -> CoreResult<String> {
    let t = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    Err(CoreError::validation(
        "completedAt must be YYYY-MM-DD or an RFC 3339 timestamp",
    ))
}

pub fn back_enter_lessons(
    conn: &Connection,
    actor: &Actor,
    req: &BackEntryRequest,
    lesson_ids: &[String],
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    if lesson_ids.is_empty() {
        return Err(CoreError::validation("lessonIds must not be empty"));
    }
    import(conn, actor, req, lesson_ids, false)
}

/// Every lesson currently in the course. Lessons added since an earlier
/// call are picked up; already-imported ones are skipped as usual.
pub fn back_enter_course(
    conn: &Connection,
    actor: &Actor,
    req: &BackEntryRequest,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let lesson_ids: Vec<String> = catalog::lessons_for_course(conn, &req.course_id)?
        .into_iter()
        .map(|l| l.id)
        .collect();
    if lesson_ids.is_empty() {
        catalog::load_course(conn, &req.course_id)?;
        return Err(CoreError::validation("course has no lessons"));
    }
    import(conn, actor, req, &lesson_ids, true)
}

fn import(
    conn: &Connection,
    actor: &Actor,
    req: &BackEntryRequest,
    lesson_ids: &[String],
    full_course: bool,
) -> CoreResult<Outcome> {
    let student = catalog::load_user(conn, &req.student_id)?;
    if student.role != Role::Student {
        return Err(CoreError::validation("back-entry target must be a student"));
    }
    catalog::load_course(conn, &req.course_id)?;
    let stamp = match req.completed_at.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => parse_historical_date(raw)?,
        None => db::now_stamp(),
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut lessons = Vec::new();
    for lesson_id in lesson_ids {
        if !seen.insert(lesson_id.as_str()) {
            continue;
        }
        let lesson = catalog::load_lesson(conn, lesson_id)?;
        if lesson.course_id != req.course_id {
            return Err(CoreError::validation(format!(
                "lesson {} does not belong to course {}",
                lesson.id, req.course_id
            )));
        }
        lessons.push(lesson);
    }

    let (enrollment, enrollment_created) =
        catalog::ensure_enrollment(conn, &student.id, &req.course_id, EnrollmentStatus::Active)?;

    let mut imported: Vec<String> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    for lesson in &lessons {
        let submission_id = db::new_id();
        let inserted = conn.execute(
            "INSERT INTO submissions(id, student_id, lesson_id, status, grade, is_backentered,
                                     graded_by, graded_at, submitted_at, created_at)
             VALUES(?, ?, ?, 'graded_pass', 100, 1, ?, ?, ?, ?)
             ON CONFLICT(student_id, lesson_id) DO NOTHING",
            (
                &submission_id,
                &student.id,
                &lesson.id,
                &actor.id,
                &stamp,
                &stamp,
                db::now_stamp(),
            ),
        )?;
        if inserted == 0 {
            skipped.push(lesson.id.clone());
            continue;
        }
        for question in catalog::questions_for_lesson(conn, &lesson.id)? {
            conn.execute(
                "INSERT INTO answers(id, submission_id, question_id, answer_text, needs_correction, updated_at)
                 VALUES(?, ?, ?, ?, 0, ?)
                 ON CONFLICT(submission_id, question_id) DO NOTHING",
                (
                    db::new_id(),
                    &submission_id,
                    &question.id,
                    PLACEHOLDER_ANSWER,
                    &stamp,
                ),
            )?;
        }
        imported.push(lesson.id.clone());
    }

    let complete = completion::is_course_complete(conn, &student.id, &req.course_id)?;
    let (certificate, certificate_created) = if complete || full_course {
        let (cert, created) = certificates::create_backentered(
            conn,
            &student.id,
            &req.course_id,
            req.certificate_number.as_deref(),
            &stamp,
        )?;
        (Some(cert), created)
    } else {
        (None, false)
    };

    info!(
        student_id = %student.id,
        course_id = %req.course_id,
        imported = imported.len(),
        skipped = skipped.len(),
        certificate_created,
        full_course,
        by = %actor.id,
        "back-entry applied"
    );

    Ok(Outcome::silent(json!({
        "enrollmentId": enrollment.id,
        "enrollmentCreated": enrollment_created,
        "importedLessonIds": imported,
        "skippedLessonIds": skipped,
        "courseComplete": complete,
        "certificate": certificate,
        "certificateCreated": certificate_created,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn historical_dates_normalize_to_utc() {
        assert_eq!(
            parse_historical_date("2019-06-30").expect("date"),
            "2019-06-30T00:00:00Z"
        );
        assert_eq!(
            parse_historical_date("2019-06-30T10:00:00+02:00").expect("rfc3339"),
            "2019-06-30T08:00:00Z"
        );
        assert_eq!(
            parse_historical_date("30.06.2019").unwrap_err().code(),
            "validation_error"
        );
    }
}
