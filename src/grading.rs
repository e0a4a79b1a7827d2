//! Grade computation, the partial-correction lock, and the grading queue.

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use crate::auth::{require_role, Actor, Role};
use crate::catalog::{self, Lesson};
use crate::certificates::Certificate;
use crate::completion;
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{self, Answer, Submission, SubmissionStatus};
use crate::notify::{Dispatch, Email, Notification, Outcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub answer_id: String,
    #[serde(default)]
    pub feedback: Option<String>,
    pub needs_correction: bool,
}

/// An answer is locked once the submission has been graded and the answer
/// was found correct. Locked answers are never re-presented or regraded.
pub fn is_locked(grade: Option<i64>, needs_correction: Option<bool>) -> bool {
    grade.is_some() && needs_correction == Some(false)
}

/// `round(100 * correct / total)`, halves rounding up. A lesson without
/// questions has nothing to get wrong.
pub fn compute_grade(correct: usize, total: usize) -> i64 {
    if total == 0 {
        return 100;
    }
    let correct = correct.min(total) as i64;
    let total = total as i64;
    (200 * correct + total) / (2 * total)
}

/// Recounts correct answers for the submission from stored state.
pub fn recount_grade(conn: &Connection, submission: &Submission) -> CoreResult<i64> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM questions WHERE lesson_id = ?",
        [&submission.lesson_id],
        |r| r.get(0),
    )?;
    let correct: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM answers a
         JOIN questions q ON q.id = a.question_id
         WHERE a.submission_id = ? AND q.lesson_id = ? AND a.needs_correction = 0",
        (&submission.id, &submission.lesson_id),
        |r| r.get(0),
    )?;
    Ok(compute_grade(correct as usize, total as usize))
}

fn require_grader_for(conn: &Connection, actor: &Actor, student_id: &str) -> CoreResult<()> {
    require_role(actor, &[Role::Supervisor, Role::Admin])?;
    if actor.is_admin() {
        return Ok(());
    }
    let student = catalog::load_user(conn, student_id)?;
    if student.supervisor_id.as_deref() != Some(actor.id.as_str()) {
        return Err(CoreError::not_authorized("not this student's supervisor"));
    }
    Ok(())
}

/// Advisory only: true when an earlier lesson of the course has neither a
/// passed nor a pending submission from this student.
pub fn is_out_of_order(conn: &Connection, student_id: &str, lesson: &Lesson) -> CoreResult<bool> {
    let skipped: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM lessons l
         WHERE l.course_id = ? AND l.sort_order < ?
           AND NOT EXISTS (
             SELECT 1 FROM submissions s
             WHERE s.lesson_id = l.id AND s.student_id = ?
               AND s.status IN ('graded_pass', 'submitted')
           )",
        (&lesson.course_id, lesson.sort_order, student_id),
        |r| r.get(0),
    )?;
    Ok(skipped > 0)
}

pub fn grading_queue(conn: &Connection, actor: &Actor) -> CoreResult<Outcome> {
    require_role(actor, &[Role::Supervisor, Role::Admin])?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.student_id, u.display_name, s.lesson_id, s.grade, s.submitted_at
         FROM submissions s
         JOIN users u ON u.id = s.student_id
         WHERE s.status = 'submitted'
           AND (?1 IS NULL OR u.supervisor_id = ?1)
         ORDER BY s.submitted_at, s.id",
    )?;
    let scope: Option<&str> = if actor.is_admin() {
        None
    } else {
        Some(actor.id.as_str())
    };
    let rows = stmt
        .query_map([scope], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<i64>>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (submission_id, student_id, student_name, lesson_id, grade, submitted_at) in rows {
        let lesson = catalog::load_lesson(conn, &lesson_id)?;
        let out_of_order = is_out_of_order(conn, &student_id, &lesson)?;
        items.push(json!({
            "submissionId": submission_id,
            "studentId": student_id,
            "studentName": student_name,
            "lessonId": lesson.id,
            "lessonTitle": lesson.title,
            "courseId": lesson.course_id,
            "lessonSortOrder": lesson.sort_order,
            "regrade": grade.is_some(),
            "submittedAt": submitted_at,
            "outOfOrder": out_of_order,
        }));
    }
    Ok(Outcome::silent(json!({ "items": items })))
}

pub fn grading_open(conn: &Connection, actor: &Actor, submission_id: &str) -> CoreResult<Outcome> {
    let submission = lifecycle::load_submission(conn, submission_id)?;
    require_grader_for(conn, actor, &submission.student_id)?;
    let lesson = catalog::load_lesson(conn, &submission.lesson_id)?;
    let questions = catalog::questions_for_lesson(conn, &lesson.id)?;
    let answers: HashMap<String, Answer> = lifecycle::answers_for_submission(conn, &submission.id)?
        .into_iter()
        .map(|a| (a.question_id.clone(), a))
        .collect();

    let items: Vec<serde_json::Value> = questions
        .iter()
        .map(|q| {
            let answer = answers.get(&q.id);
            let locked = answer.is_some_and(|a| is_locked(submission.grade, a.needs_correction));
            json!({
                "question": q,
                "answer": answer,
                "locked": locked,
            })
        })
        .collect();

    Ok(Outcome::silent(json!({
        "submission": submission,
        "lesson": lesson,
        "outOfOrder": is_out_of_order(conn, &submission.student_id, &lesson)?,
        "items": items,
    })))
}

/// Applies supervisor verdicts to the unlocked answers and recomputes the
/// grade from the full answer set.
pub fn grade_submission(
    conn: &Connection,
    actor: &Actor,
    submission_id: &str,
    verdicts: &[Verdict],
) -> CoreResult<Outcome> {
    let submission = lifecycle::load_submission(conn, submission_id)?;
    require_grader_for(conn, actor, &submission.student_id)?;
    if submission.status != SubmissionStatus::Submitted {
        return Err(CoreError::invalid_state(
            "only submitted lessons can be graded",
            Some(submission.status.as_str()),
        ));
    }

    let lesson = catalog::load_lesson(conn, &submission.lesson_id)?;
    let questions: HashMap<String, bool> = catalog::questions_for_lesson(conn, &lesson.id)?
        .into_iter()
        .map(|q| (q.id, q.requires_image))
        .collect();
    let answers = lifecycle::answers_for_submission(conn, &submission.id)?;

    let by_answer: HashMap<&str, &Verdict> = verdicts
        .iter()
        .map(|v| (v.answer_id.as_str(), v))
        .collect();
    let unknown: Vec<&str> = by_answer
        .keys()
        .copied()
        .filter(|id| !answers.iter().any(|a| a.id == *id))
        .collect();
    if !unknown.is_empty() {
        return Err(CoreError::validation(format!(
            "answers not in submission: {}",
            unknown.join(", ")
        )));
    }

    let unlocked: Vec<&Answer> = answers
        .iter()
        .filter(|a| !is_locked(submission.grade, a.needs_correction))
        .collect();
    let missing: Vec<&str> = unlocked
        .iter()
        .filter(|a| !by_answer.contains_key(a.id.as_str()))
        .map(|a| a.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(CoreError::validation(format!(
            "missing verdicts for answers: {}",
            missing.join(", ")
        )));
    }

    for answer in &unlocked {
        let Some(verdict) = by_answer.get(answer.id.as_str()) else {
            continue;
        };
        let feedback = verdict
            .feedback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        let requires_image = questions.get(&answer.question_id).copied().unwrap_or(false);
        if verdict.needs_correction && requires_image {
            // A stale upload must not count as attached on resubmission.
            conn.execute(
                "UPDATE answers
                 SET needs_correction = 1, supervisor_feedback = ?, image_path = NULL
                 WHERE id = ?",
                (feedback, &answer.id),
            )?;
        } else {
            conn.execute(
                "UPDATE answers SET needs_correction = ?, supervisor_feedback = ? WHERE id = ?",
                (verdict.needs_correction, feedback, &answer.id),
            )?;
        }
    }

    let grade = recount_grade(conn, &submission)?;
    let status = if grade == 100 {
        SubmissionStatus::GradedPass
    } else {
        SubmissionStatus::GradedCorrections
    };
    conn.execute(
        "UPDATE submissions SET status = ?, grade = ?, graded_by = ?, graded_at = ? WHERE id = ?",
        (status.as_str(), grade, &actor.id, db::now_stamp(), &submission.id),
    )?;
    info!(
        submission_id = %submission.id,
        grade,
        status = status.as_str(),
        graded_by = %actor.id,
        "submission graded"
    );

    let certificate = if status == SubmissionStatus::GradedPass {
        completion::on_lesson_passed(conn, &submission.student_id, &lesson.course_id)?
    } else {
        None
    };

    let dispatches = student_dispatches(conn, &submission, &lesson, grade, status, certificate.as_ref())?;
    let updated = lifecycle::load_submission(conn, &submission.id)?;
    Ok(Outcome {
        result: json!({
            "submission": updated,
            "certificate": certificate,
        }),
        dispatches,
    })
}

/// First lesson of the course, in order, the student has not yet passed.
fn next_open_lesson(conn: &Connection, student_id: &str, course_id: &str) -> CoreResult<Option<Lesson>> {
    for lesson in catalog::lessons_for_course(conn, course_id)? {
        let passed = lifecycle::find_submission(conn, student_id, &lesson.id)?
            .is_some_and(|s| s.status == SubmissionStatus::GradedPass);
        if !passed {
            return Ok(Some(lesson));
        }
    }
    Ok(None)
}

fn student_dispatches(
    conn: &Connection,
    submission: &Submission,
    lesson: &Lesson,
    grade: i64,
    status: SubmissionStatus,
    certificate: Option<&Certificate>,
) -> CoreResult<Vec<Dispatch>> {
    let student = catalog::load_user(conn, &submission.student_id)?;
    let (title, message, link) = if status == SubmissionStatus::GradedPass {
        let link = match certificate {
            Some(cert) => Some(format!("/certificates/{}", cert.id)),
            None => next_open_lesson(conn, &student.id, &lesson.course_id)?
                .map(|l| format!("/lessons/{}", l.id)),
        };
        (
            format!("Lesson passed: {}", lesson.title),
            format!("Your answers for \"{}\" were graded {}%.", lesson.title, grade),
            link,
        )
    } else {
        (
            format!("Corrections requested: {}", lesson.title),
            format!(
                "Your answers for \"{}\" were graded {}%. Please revise the marked answers and resubmit.",
                lesson.title, grade
            ),
            Some(format!("/lessons/{}", lesson.id)),
        )
    };

    let mut out = vec![Dispatch::Notify(Notification {
        user_id: student.id.clone(),
        kind: "lesson_graded",
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
