//! Per-(student, lesson) submission state machine and the answer store.
//!
//! ```text
//! draft ──submit──▶ submitted ──grade──▶ graded_pass (terminal for students)
//!                       ▲                    │
//!                       └──resubmit── graded_corrections
//! ```

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::auth::{require_role, Actor, Role};
use crate::catalog::{self, Lesson, Question};
use crate::db;
use crate::error::{CoreError, CoreResult, IncompleteReason};
use crate::notify::{Dispatch, Email, Notification, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Draft,
    Submitted,
    GradedPass,
    GradedCorrections,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Draft => "draft",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::GradedPass => "graded_pass",
            SubmissionStatus::GradedCorrections => "graded_corrections",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(SubmissionStatus::Draft),
            "submitted" => Some(SubmissionStatus::Submitted),
            "graded_pass" => Some(SubmissionStatus::GradedPass),
            "graded_corrections" => Some(SubmissionStatus::GradedCorrections),
            _ => None,
        }
    }

    /// Whether the student may change answers in this state.
    pub fn is_editable(self) -> bool {
        matches!(
            self,
            SubmissionStatus::Draft | SubmissionStatus::GradedCorrections
        )
    }
}

impl FromSql for SubmissionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        SubmissionStatus::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown submission status {raw}").into()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
    pub student_id: String,
    pub lesson_id: String,
    pub status: SubmissionStatus,
    pub grade: Option<i64>,
    pub is_backentered: bool,
    pub graded_by: Option<String>,
    pub graded_at: Option<String>,
    pub submitted_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub id: String,
    pub submission_id: String,
    pub question_id: String,
    pub answer_text: String,
    pub needs_correction: Option<bool>,
    pub supervisor_feedback: Option<String>,
    pub image_path: Option<String>,
    pub updated_at: Option<String>,
}

impl Answer {
    fn is_filled(&self, question: &Question) -> bool {
        !self.answer_text.trim().is_empty()
            && (!question.requires_image || self.image_path.is_some())
    }
}

const SUBMISSION_COLUMNS: &str = "id, student_id, lesson_id, status, grade, is_backentered,
     graded_by, graded_at, submitted_at, created_at";

fn submission_from_row(r: &Row<'_>) -> rusqlite::Result<Submission> {
    Ok(Submission {
        id: r.get(0)?,
        student_id: r.get(1)?,
        lesson_id: r.get(2)?,
        status: r.get(3)?,
        grade: r.get(4)?,
        is_backentered: r.get::<_, i64>(5)? != 0,
        graded_by: r.get(6)?,
        graded_at: r.get(7)?,
        submitted_at: r.get(8)?,
        created_at: r.get(9)?,
    })
}

fn answer_from_row(r: &Row<'_>) -> rusqlite::Result<Answer> {
    Ok(Answer {
        id: r.get(0)?,
        submission_id: r.get(1)?,
        question_id: r.get(2)?,
        answer_text: r.get(3)?,
        needs_correction: r.get(4)?,
        supervisor_feedback: r.get(5)?,
        image_path: r.get(6)?,
        updated_at: r.get(7)?,
    })
}

pub fn load_submission(conn: &Connection, submission_id: &str) -> CoreResult<Submission> {
    let sql = format!("SELECT {} FROM submissions WHERE id = ?", SUBMISSION_COLUMNS);
    conn.query_row(&sql, [submission_id], submission_from_row)
        .optional()?
        .ok_or_else(|| CoreError::not_found("submission", submission_id))
}

pub fn find_submission(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
) -> CoreResult<Option<Submission>> {
    let sql = format!(
        "SELECT {} FROM submissions WHERE student_id = ? AND lesson_id = ?",
        SUBMISSION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, (student_id, lesson_id), submission_from_row)
        .optional()?)
}

/// Creates the draft on first access. A concurrent creator winning the
/// unique (student, lesson) race is not an error; its row is returned.
pub fn ensure_submission(
    conn: &Connection,
    student_id: &str,
    lesson_id: &str,
) -> CoreResult<Submission> {
    let inserted = conn.execute(
        "INSERT INTO submissions(id, student_id, lesson_id, status, is_backentered, created_at)
         VALUES(?, ?, ?, 'draft', 0, ?)
         ON CONFLICT(student_id, lesson_id) DO NOTHING",
        (db::new_id(), student_id, lesson_id, db::now_stamp()),
    )?;
    if inserted > 0 {
        debug!(student_id, lesson_id, "draft submission created");
    }
    find_submission(conn, student_id, lesson_id)?
        .ok_or_else(|| CoreError::not_found("submission", format!("{student_id}/{lesson_id}")))
}

pub fn answers_for_submission(conn: &Connection, submission_id: &str) -> CoreResult<Vec<Answer>> {
    let mut stmt = conn.prepare(
        "SELECT id, submission_id, question_id, answer_text, needs_correction,
                supervisor_feedback, image_path, updated_at
         FROM answers
         WHERE submission_id = ?",
    )?;
    let rows = stmt
        .query_map([submission_id], answer_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn answers_by_question(conn: &Connection, submission_id: &str) -> CoreResult<HashMap<String, Answer>> {
    Ok(answers_for_submission(conn, submission_id)?
        .into_iter()
        .map(|a| (a.question_id.clone(), a))
        .collect())
}

/// Last-write-wins upsert of the answer text for (submission, question).
pub fn upsert_answer_text(
    conn: &Connection,
    submission_id: &str,
    question_id: &str,
    text: &str,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO answers(id, submission_id, question_id, answer_text, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(submission_id, question_id) DO UPDATE SET
           answer_text = excluded.answer_text,
           updated_at = excluded.updated_at",
        (db::new_id(), submission_id, question_id, text, db::now_stamp()),
    )?;
    Ok(())
}

fn upsert_answer_image(
    conn: &Connection,
    submission_id: &str,
    question_id: &str,
    image_path: Option<&str>,
) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO answers(id, submission_id, question_id, answer_text, image_path, updated_at)
         VALUES(?, ?, ?, '', ?, ?)
         ON CONFLICT(submission_id, question_id) DO UPDATE SET
           image_path = excluded.image_path,
           updated_at = excluded.updated_at",
        (db::new_id(), submission_id, question_id, image_path, db::now_stamp()),
    )?;
    Ok(())
}

/// Whether the student may edit this answer in the submission's current state.
pub fn answer_is_editable(status: SubmissionStatus, answer: Option<&Answer>) -> bool {
    match status {
        SubmissionStatus::Draft => true,
        // Graded answers carry a verdict; a question added after grading has
        // none and stays open alongside the ones flagged for correction.
        SubmissionStatus::GradedCorrections => {
            answer.and_then(|a| a.needs_correction) != Some(false)
        }
        SubmissionStatus::Submitted | SubmissionStatus::GradedPass => false,
    }
}

fn require_student_self(actor: &Actor) -> CoreResult<()> {
    require_role(actor, &[Role::Student])
}

/// Loads the lesson and checks the student holds an active enrollment in
/// its course.
fn lesson_for_student(conn: &Connection, student_id: &str, lesson_id: &str) -> CoreResult<Lesson> {
    let lesson = catalog::load_lesson(conn, lesson_id)?;
    match catalog::find_enrollment(conn, student_id, &lesson.course_id)? {
        Some(e) if e.is_active() => Ok(lesson),
        Some(e) => Err(CoreError::not_authorized(format!(
            "enrollment is {}",
            e.status
        ))),
        None => Err(CoreError::not_authorized("not enrolled in this course")),
    }
}

pub fn submission_view(conn: &Connection, submission: &Submission) -> CoreResult<serde_json::Value> {
    let questions = catalog::questions_for_lesson(conn, &submission.lesson_id)?;
    let answers = answers_by_question(conn, &submission.id)?;
    let items: Vec<serde_json::Value> = questions
        .iter()
        .map(|q| {
            let answer = answers.get(&q.id);
            json!({
                "question": q,
                "answer": answer,
                "editable": answer_is_editable(submission.status, answer),
            })
        })
        .collect();
    Ok(json!({
        "submission": submission,
        "items": items,
    }))
}

pub fn open_lesson(conn: &Connection, actor: &Actor, lesson_id: &str) -> CoreResult<Outcome> {
    require_student_self(actor)?;
    let lesson = lesson_for_student(conn, &actor.id, lesson_id)?;
    let submission = ensure_submission(conn, &actor.id, &lesson.id)?;
    let mut view = submission_view(conn, &submission)?;
    view["lesson"] = json!(lesson);
    Ok(Outcome::silent(view))
}

pub fn get_submission(conn: &Connection, actor: &Actor, submission_id: &str) -> CoreResult<Outcome> {
    let submission = load_submission(conn, submission_id)?;
    match actor.role {
        Role::Admin => {}
        Role::Student if actor.id == submission.student_id => {}
        Role::Supervisor => {
            let student = catalog::load_user(conn, &submission.student_id)?;
            if student.supervisor_id.as_deref() != Some(actor.id.as_str()) {
                return Err(CoreError::not_authorized("not this student's supervisor"));
            }
        }
        _ => return Err(CoreError::not_authorized("not your submission")),
    }
    Ok(Outcome::silent(submission_view(conn, &submission)?))
}

/// Saves answer texts. In `graded_corrections` only answers flagged for
/// correction are written; every other pair is dropped here, which is what
/// keeps correct answers frozen.
pub fn save_answers(
    conn: &Connection,
    actor: &Actor,
    lesson_id: &str,
    pairs: &[(String, String)],
) -> CoreResult<Outcome> {
    require_student_self(actor)?;
    let lesson = lesson_for_student(conn, &actor.id, lesson_id)?;
    let submission = ensure_submission(conn, &actor.id, &lesson.id)?;
    if !submission.status.is_editable() {
        return Err(CoreError::invalid_state(
            "answers can only be edited in draft or graded_corrections",
            Some(submission.status.as_str()),
        ));
    }

    let question_ids: HashSet<String> = catalog::questions_for_lesson(conn, &lesson.id)?
        .into_iter()
        .map(|q| q.id)
        .collect();
    let unknown: Vec<&str> = pairs
        .iter()
        .map(|(qid, _)| qid.as_str())
        .filter(|qid| !question_ids.contains(*qid))
        .collect();
    if !unknown.is_empty() {
        return Err(CoreError::validation(format!(
            "questions not in lesson: {}",
            unknown.join(", ")
        )));
    }

    let existing = answers_by_question(conn, &submission.id)?;
    let mut saved = 0usize;
    let mut ignored: Vec<String> = Vec::new();
    for (question_id, text) in pairs {
        if !answer_is_editable(submission.status, existing.get(question_id)) {
            ignored.push(question_id.clone());
            continue;
        }
        upsert_answer_text(conn, &submission.id, question_id, text)?;
        saved += 1;
    }

    Ok(Outcome::silent(json!({
        "submissionId": submission.id,
        "status": submission.status,
        "saved": saved,
        "ignoredQuestionIds": ignored,
    })))
}

pub fn attach_image(
    conn: &Connection,
    actor: &Actor,
    lesson_id: &str,
    question_id: &str,
    image_path: Option<&str>,
) -> CoreResult<Outcome> {
    require_student_self(actor)?;
    let lesson = lesson_for_student(conn, &actor.id, lesson_id)?;
    let question = catalog::questions_for_lesson(conn, &lesson.id)?
        .into_iter()
        .find(|q| q.id == question_id)
        .ok_or_else(|| CoreError::validation("question is not part of this lesson"))?;
    if !question.requires_image {
        return Err(CoreError::validation("question does not take an image"));
    }
    let image_path = image_path.map(str::trim).filter(|p| !p.is_empty());

    let submission = ensure_submission(conn, &actor.id, &lesson.id)?;
    let existing = answers_by_question(conn, &submission.id)?;
    if !answer_is_editable(submission.status, existing.get(question_id)) {
        return Err(CoreError::invalid_state(
            "answer is not editable",
            Some(submission.status.as_str()),
        ));
    }
    upsert_answer_image(conn, &submission.id, question_id, image_path)?;
    Ok(Outcome::silent(json!({
        "submissionId": submission.id,
        "questionId": question_id,
        "imagePath": image_path,
    })))
}

pub fn submit_lesson(conn: &Connection, actor: &Actor, lesson_id: &str) -> CoreResult<Outcome> {
    require_student_self(actor)?;
    let lesson = lesson_for_student(conn, &actor.id, lesson_id)?;
    let submission = ensure_submission(conn, &actor.id, &lesson.id)?;
    let questions = catalog::questions_for_lesson(conn, &lesson.id)?;
    let answers = answers_by_question(conn, &submission.id)?;

    let resubmission = match submission.status {
        SubmissionStatus::Draft => false,
        SubmissionStatus::GradedCorrections => true,
        other => {
            return Err(CoreError::invalid_state(
                "lesson can only be submitted from draft or graded_corrections",
                Some(other.as_str()),
            ))
        }
    };

    // Unfilled answers without a verdict count as unanswered even on
    // resubmission (questions added after grading).
    let mut unanswered: Vec<String> = Vec::new();
    let mut unrevised: Vec<String> = Vec::new();
    for q in &questions {
        let answer = answers.get(&q.id);
        if answer.is_some_and(|a| a.is_filled(q)) {
            continue;
        }
        match answer.and_then(|a| a.needs_correction) {
            Some(false) if resubmission => {}
            Some(true) if resubmission => unrevised.push(q.id.clone()),
            _ => unanswered.push(q.id.clone()),
        }
    }
    if !unanswered.is_empty() {
        return Err(CoreError::IncompleteSubmission {
            reason: IncompleteReason::QuestionsUnanswered,
            message: format!("{} question(s) are unanswered", unanswered.len()),
            question_ids: unanswered,
        });
    }
    if !unrevised.is_empty() {
        return Err(CoreError::IncompleteSubmission {
            reason: IncompleteReason::CorrectionsNotRevised,
            message: format!(
                "{} answer(s) marked for correction have not been revised",
                unrevised.len()
            ),
            question_ids: unrevised,
        });
    }

    let now = db::now_stamp();
    conn.execute(
        "UPDATE submissions SET status = 'submitted', submitted_at = ? WHERE id = ?",
        (&now, &submission.id),
    )?;
    info!(
        submission_id = %submission.id,
        student_id = %actor.id,
        lesson_id = %lesson.id,
        resubmission,
        "lesson submitted"
    );

    let dispatches = supervisor_dispatches(conn, &actor.id, &lesson, &submission.id, resubmission)?;
    let updated = load_submission(conn, &submission.id)?;
    Ok(Outcome {
        result: json!({ "submission": updated, "resubmission": resubmission }),
        dispatches,
    })
}

fn supervisor_dispatches(
    conn: &Connection,
    student_id: &str,
    lesson: &Lesson,
    submission_id: &str,
    resubmission: bool,
) -> CoreResult<Vec<Dispatch>> {
    let student = catalog::load_user(conn, student_id)?;
    let Some(supervisor_id) = student.supervisor_id.as_deref() else {
        debug!(student_id, "student has no supervisor; submission not announced");
        return Ok(Vec::new());
    };
    let Some(supervisor) = catalog::find_user(conn, supervisor_id)? else {
        return Ok(Vec::new());
    };

    let (kind, title) = if resubmission {
        ("lesson_resubmitted", "Corrections resubmitted")
    } else {
        ("lesson_submitted", "New lesson submission")
    };
    let message = if resubmission {
        format!(
            "{} revised their answers for \"{}\" and is waiting for a new review.",
            student.display_name, lesson.title
        )
    } else {
        format!(
            "{} submitted \"{}\" for grading.",
            student.display_name, lesson.title
        )
    };
    let link = Some(format!("/grading/{}", submission_id));

    let mut out = vec![Dispatch::Notify(Notification {
        user_id: supervisor.id.clone(),
        kind,
        title: title.to_string(),
        message: message.clone(),
        link: link.clone(),
    })];
    if let Some(email) = supervisor.email {
        out.push(Dispatch::Email(Email {
            to: email,
            subject: title.to_string(),
            body: message,
            link,
        }));
    }
    Ok(out)
}
