//! Administrative corrections: reopening submissions, removing back-entered
//! work, moving enrollments and merging duplicate profiles. None of these
//! notify the student. Each leaves the completion/certificate state
//! reconciled before returning.

use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::auth::{require_role, Actor, Role};
use crate::catalog::{self, Enrollment, EnrollmentStatus};
use crate::certificates::{self, CertificateStatus};
use crate::completion;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{self, SubmissionStatus};
use crate::notify::Outcome;

fn course_of_lesson(conn: &Connection, lesson_id: &str) -> CoreResult<String> {
    Ok(catalog::load_lesson(conn, lesson_id)?.course_id)
}

/// Back to `submitted` for a full regrade; answer texts stay.
pub fn revert_to_submitted(conn: &Connection, actor: &Actor, submission_id: &str) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let submission = lifecycle::load_submission(conn, submission_id)?;
    if !matches!(
        submission.status,
        SubmissionStatus::GradedPass | SubmissionStatus::GradedCorrections
    ) {
        return Err(CoreError::invalid_state(
            "only graded submissions can be reverted",
            Some(submission.status.as_str()),
        ));
    }
    conn.execute(
        "UPDATE submissions
         SET status = 'submitted', grade = NULL, graded_by = NULL, graded_at = NULL
         WHERE id = ?",
        [&submission.id],
    )?;
    conn.execute(
        "UPDATE answers SET needs_correction = NULL, supervisor_feedback = NULL
         WHERE submission_id = ?",
        [&submission.id],
    )?;
    let course_id = course_of_lesson(conn, &submission.lesson_id)?;
    let reconciliation = completion::reconcile_after_removal(conn, &submission.student_id, &course_id)?;
    info!(submission_id = %submission.id, by = %actor.id, "submission reverted to submitted");
    Ok(Outcome::silent(json!({
        "submission": lifecycle::load_submission(conn, &submission.id)?,
        "reconciliation": reconciliation,
    })))
}

/// Back to an empty draft: verdicts, texts and images are all cleared.
pub fn reset_to_draft(conn: &Connection, actor: &Actor, submission_id: &str) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let submission = lifecycle::load_submission(conn, submission_id)?;
    if submission.status == SubmissionStatus::Draft {
        return Err(CoreError::invalid_state(
            "submission is already a draft",
            Some(submission.status.as_str()),
        ));
    }
    conn.execute(
        "UPDATE submissions
         SET status = 'draft', grade = NULL, graded_by = NULL, graded_at = NULL,
             submitted_at = NULL, is_backentered = 0
         WHERE id = ?",
        [&submission.id],
    )?;
    conn.execute(
        "UPDATE answers
         SET answer_text = '', image_path = NULL, needs_correction = NULL, supervisor_feedback = NULL
         WHERE submission_id = ?",
        [&submission.id],
    )?;
    let course_id = course_of_lesson(conn, &submission.lesson_id)?;
    let reconciliation = completion::reconcile_after_removal(conn, &submission.student_id, &course_id)?;
    info!(submission_id = %submission.id, by = %actor.id, "submission reset to draft");
    Ok(Outcome::silent(json!({
        "submission": lifecycle::load_submission(conn, &submission.id)?,
        "reconciliation": reconciliation,
    })))
}

fn delete_submission_rows(conn: &Connection, submission_id: &str) -> CoreResult<usize> {
    conn.execute("DELETE FROM answers WHERE submission_id = ?", [submission_id])?;
    Ok(conn.execute("DELETE FROM submissions WHERE id = ?", [submission_id])?)
}

pub fn delete_backentered_submission(
    conn: &Connection,
    actor: &Actor,
    submission_id: &str,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let submission = lifecycle::load_submission(conn, submission_id)?;
    if !submission.is_backentered {
        return Err(CoreError::invalid_state(
            "only back-entered submissions can be deleted",
            Some(submission.status.as_str()),
        ));
    }
    let course_id = course_of_lesson(conn, &submission.lesson_id)?;
    delete_submission_rows(conn, &submission.id)?;
    let reconciliation = completion::reconcile_after_removal(conn, &submission.student_id, &course_id)?;
    info!(submission_id = %submission.id, by = %actor.id, "back-entered submission deleted");
    Ok(Outcome::silent(json!({
        "deletedSubmissionIds": [submission.id],
        "reconciliation": reconciliation,
    })))
}

pub fn delete_backentered_course(
    conn: &Connection,
    actor: &Actor,
    student_id: &str,
    course_id: &str,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    catalog::load_user(conn, student_id)?;
    catalog::load_course(conn, course_id)?;
    let mut stmt = conn.prepare(
        "SELECT s.id
         FROM submissions s
         JOIN lessons l ON l.id = s.lesson_id
         WHERE s.student_id = ? AND l.course_id = ? AND s.is_backentered = 1",
    )?;
    let ids = stmt
        .query_map((student_id, course_id), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in &ids {
        delete_submission_rows(conn, id)?;
    }
    let reconciliation = completion::reconcile_after_removal(conn, student_id, course_id)?;
    info!(student_id, course_id, deleted = ids.len(), by = %actor.id, "back-entered course deleted");
    Ok(Outcome::silent(json!({
        "deletedSubmissionIds": ids,
        "reconciliation": reconciliation,
    })))
}

#[derive(Debug, Default)]
struct Purge {
    submissions: usize,
    certificate_id: Option<String>,
}

/// Removes every submission (with answers) and the certificate the student
/// holds for the course. The enrollment row is left to the caller.
fn purge_course_records(conn: &Connection, student_id: &str, course_id: &str) -> CoreResult<Purge> {
    conn.execute(
        "DELETE FROM answers WHERE submission_id IN (
           SELECT s.id FROM submissions s
           JOIN lessons l ON l.id = s.lesson_id
           WHERE s.student_id = ? AND l.course_id = ?
         )",
        (student_id, course_id),
    )?;
    let submissions = conn.execute(
        "DELETE FROM submissions
         WHERE student_id = ? AND lesson_id IN (SELECT id FROM lessons WHERE course_id = ?)",
        (student_id, course_id),
    )?;
    let certificate_id = match certificates::find_certificate(conn, student_id, course_id)? {
        Some(cert) => {
            certificates::remove_certificate(conn, &cert.id)?;
            Some(cert.id)
        }
        None => None,
    };
    Ok(Purge {
        submissions,
        certificate_id,
    })
}

fn require_issued_confirmation(
    conn: &Connection,
    enrollment: &Enrollment,
    confirm_issued: bool,
) -> CoreResult<()> {
    let cert = certificates::find_certificate(conn, &enrollment.student_id, &enrollment.course_id)?;
    if cert.is_some_and(|c| c.status == CertificateStatus::Issued) && !confirm_issued {
        return Err(CoreError::validation(
            "an issued certificate would be deleted; pass confirmIssued to proceed",
        ));
    }
    Ok(())
}

fn replace_enrollment(
    conn: &Connection,
    old: &Enrollment,
    student_id: &str,
    course_id: &str,
) -> CoreResult<(Enrollment, Purge)> {
    let purge = purge_course_records(conn, &old.student_id, &old.course_id)?;
    conn.execute("DELETE FROM enrollments WHERE id = ?", [&old.id])?;
    let status = EnrollmentStatus::parse(&old.status).unwrap_or(EnrollmentStatus::Active);
    let (enrollment, _) = catalog::ensure_enrollment(conn, student_id, course_id, status)?;
    Ok((enrollment, purge))
}

pub fn change_enrollment_course(
    conn: &Connection,
    actor: &Actor,
    enrollment_id: &str,
    new_course_id: &str,
    confirm_issued: bool,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let old = catalog::load_enrollment(conn, enrollment_id)?;
    catalog::load_course(conn, new_course_id)?;
    if old.course_id == new_course_id {
        return Err(CoreError::validation("enrollment is already in that course"));
    }
    if catalog::find_enrollment(conn, &old.student_id, new_course_id)?.is_some() {
        return Err(CoreError::validation("student is already enrolled in the target course"));
    }
    require_issued_confirmation(conn, &old, confirm_issued)?;

    let (enrollment, purge) = replace_enrollment(conn, &old, &old.student_id, new_course_id)?;
    warn!(
        student_id = %old.student_id,
        from_course = %old.course_id,
        to_course = new_course_id,
        deleted_submissions = purge.submissions,
        by = %actor.id,
        "enrollment moved to another course"
    );
    Ok(Outcome::silent(json!({
        "enrollment": enrollment,
        "deletedSubmissions": purge.submissions,
        "deletedCertificateId": purge.certificate_id,
    })))
}

pub fn transfer_enrollment(
    conn: &Connection,
    actor: &Actor,
    enrollment_id: &str,
    new_student_id: &str,
    confirm_issued: bool,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    let old = catalog::load_enrollment(conn, enrollment_id)?;
    let new_student = catalog::load_user(conn, new_student_id)?;
    if new_student.role != Role::Student {
        return Err(CoreError::validation("enrollments can only be transferred to students"));
    }
    if old.student_id == new_student.id {
        return Err(CoreError::validation("enrollment already belongs to that student"));
    }
    if catalog::find_enrollment(conn, &new_student.id, &old.course_id)?.is_some() {
        return Err(CoreError::validation("target student is already enrolled in this course"));
    }
    require_issued_confirmation(conn, &old, confirm_issued)?;

    let (enrollment, purge) = replace_enrollment(conn, &old, &new_student.id, &old.course_id)?;
    warn!(
        course_id = %old.course_id,
        from_student = %old.student_id,
        to_student = %new_student.id,
        deleted_submissions = purge.submissions,
        by = %actor.id,
        "enrollment transferred to another student"
    );
    Ok(Outcome::silent(json!({
        "enrollment": enrollment,
        "deletedSubmissions": purge.submissions,
        "deletedCertificateId": purge.certificate_id,
    })))
}

fn courses_touched_by(conn: &Connection, user_id: &str) -> CoreResult<BTreeSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT course_id FROM enrollments WHERE student_id = ?1
         UNION
         SELECT l.course_id FROM submissions s JOIN lessons l ON l.id = s.lesson_id
           WHERE s.student_id = ?1
         UNION
         SELECT course_id FROM certificates WHERE student_id = ?1",
    )?;
    let rows = stmt
        .query_map([user_id], |r| r.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(rows)
}

/// Folds `source_id` into `target_id` and deletes the source. Per course,
/// the target's records win outright; the source's are moved over only
/// where the target has nothing. Must run inside a single transaction.
pub fn merge_profiles(
    conn: &Connection,
    actor: &Actor,
    source_id: &str,
    target_id: &str,
) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Admin])?;
    if source_id == target_id {
        return Err(CoreError::validation("source and target must differ"));
    }
    let source = catalog::load_user(conn, source_id)?;
    let target = catalog::load_user(conn, target_id)?;
    if source.role != target.role {
        return Err(CoreError::validation(format!(
            "cannot merge a {} profile into a {} profile",
            source.role.as_str(),
            target.role.as_str()
        )));
    }

    let source_courses = courses_touched_by(conn, &source.id)?;
    let target_courses = courses_touched_by(conn, &target.id)?;
    let mut moved: Vec<String> = Vec::new();
    let mut discarded: Vec<String> = Vec::new();

    for course_id in &source_courses {
        if target_courses.contains(course_id) {
            purge_course_records(conn, &source.id, course_id)?;
            conn.execute(
                "DELETE FROM enrollments WHERE student_id = ? AND course_id = ?",
                (&source.id, course_id),
            )?;
            discarded.push(course_id.clone());
            continue;
        }
        conn.execute(
            "UPDATE enrollments SET student_id = ? WHERE student_id = ? AND course_id = ?",
            (&target.id, &source.id, course_id),
        )?;
        conn.execute(
            "UPDATE submissions SET student_id = ?
             WHERE student_id = ? AND lesson_id IN (SELECT id FROM lessons WHERE course_id = ?)",
            (&target.id, &source.id, course_id),
        )?;
        conn.execute(
            "UPDATE certificates SET student_id = ? WHERE student_id = ? AND course_id = ?",
            (&target.id, &source.id, course_id),
        )?;
        moved.push(course_id.clone());
    }

    // References held by the source in other roles follow it to the target.
    conn.execute(
        "UPDATE users SET supervisor_id = ?1 WHERE supervisor_id = ?2",
        (&target.id, &source.id),
    )?;
    conn.execute(
        "UPDATE submissions SET graded_by = ?1 WHERE graded_by = ?2",
        (&target.id, &source.id),
    )?;
    conn.execute(
        "UPDATE certificates SET attested_by = ?1 WHERE attested_by = ?2",
        (&target.id, &source.id),
    )?;
    conn.execute(
        "UPDATE certificates SET sealed_by = ?1 WHERE sealed_by = ?2",
        (&target.id, &source.id),
    )?;
    conn.execute(
        "UPDATE notifications SET user_id = ?1 WHERE user_id = ?2",
        (&target.id, &source.id),
    )?;

    conn.execute("DELETE FROM users WHERE id = ?", [&source.id])?;

    warn!(
        source_id = %source.id,
        target_id = %target.id,
        moved = moved.len(),
        discarded = discarded.len(),
        by = %actor.id,
        "profiles merged"
    );
    Ok(Outcome::silent(json!({
        "targetId": target.id,
        "deletedSourceId": source.id,
        "movedCourseIds": moved,
        "discardedCourseIds": discarded,
    })))
}
