//! Courses, lessons, questions, users and enrollments. The catalog proper is
//! owned elsewhere; this module reads it for the engine and offers minimal
//! admin writers so a workspace can be populated.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;

use crate::auth::Role;
use crate::db;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub role: Role,
    pub supervisor_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: String,
    pub title: String,
    pub category: String,
    pub sort_order: i64,
    pub lesson_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    pub course_id: String,
    pub title: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub lesson_id: String,
    pub prompt: String,
    pub sort_order: i64,
    pub requires_image: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Active,
    PendingInvoiceVerification,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::PendingInvoiceVerification => "pending_invoice_verification",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(EnrollmentStatus::Active),
            "pending_invoice_verification" => Some(EnrollmentStatus::PendingInvoiceVerification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub status: String,
    pub created_at: String,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        EnrollmentStatus::parse(&self.status) == Some(EnrollmentStatus::Active)
    }
}

fn user_from_row(r: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: r.get(0)?,
        display_name: r.get(1)?,
        email: r.get(2)?,
        role: r.get(3)?,
        supervisor_id: r.get(4)?,
    })
}

fn course_from_row(r: &Row<'_>) -> rusqlite::Result<Course> {
    Ok(Course {
        id: r.get(0)?,
        title: r.get(1)?,
        category: r.get(2)?,
        sort_order: r.get(3)?,
        lesson_count: r.get(4)?,
    })
}

fn lesson_from_row(r: &Row<'_>) -> rusqlite::Result<Lesson> {
    Ok(Lesson {
        id: r.get(0)?,
        course_id: r.get(1)?,
        title: r.get(2)?,
        sort_order: r.get(3)?,
    })
}

fn question_from_row(r: &Row<'_>) -> rusqlite::Result<Question> {
    Ok(Question {
        id: r.get(0)?,
        lesson_id: r.get(1)?,
        prompt: r.get(2)?,
        sort_order: r.get(3)?,
        requires_image: r.get::<_, i64>(4)? != 0,
    })
}

fn enrollment_from_row(r: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        status: r.get(3)?,
        created_at: r.get(4)?,
    })
}

pub fn find_user(conn: &Connection, user_id: &str) -> CoreResult<Option<User>> {
    Ok(conn
        .query_row(
            "SELECT id, display_name, email, role, supervisor_id FROM users WHERE id = ?",
            [user_id],
            user_from_row,
        )
        .optional()?)
}

pub fn load_user(conn: &Connection, user_id: &str) -> CoreResult<User> {
    find_user(conn, user_id)?.ok_or_else(|| CoreError::not_found("user", user_id))
}

pub fn load_course(conn: &Connection, course_id: &str) -> CoreResult<Course> {
    conn.query_row(
        "SELECT id, title, category, sort_order, lesson_count FROM courses WHERE id = ?",
        [course_id],
        course_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("course", course_id))
}

pub fn load_lesson(conn: &Connection, lesson_id: &str) -> CoreResult<Lesson> {
    conn.query_row(
        "SELECT id, course_id, title, sort_order FROM lessons WHERE id = ?",
        [lesson_id],
        lesson_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("lesson", lesson_id))
}

pub fn lessons_for_course(conn: &Connection, course_id: &str) -> CoreResult<Vec<Lesson>> {
    let mut stmt = conn.prepare(
        "SELECT id, course_id, title, sort_order
         FROM lessons
         WHERE course_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([course_id], lesson_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn questions_for_lesson(conn: &Connection, lesson_id: &str) -> CoreResult<Vec<Question>> {
    let mut stmt = conn.prepare(
        "SELECT id, lesson_id, prompt, sort_order, requires_image
         FROM questions
         WHERE lesson_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([lesson_id], question_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_enrollment(conn: &Connection, enrollment_id: &str) -> CoreResult<Enrollment> {
    conn.query_row(
        "SELECT id, student_id, course_id, status, created_at FROM enrollments WHERE id = ?",
        [enrollment_id],
        enrollment_from_row,
    )
    .optional()?
    .ok_or_else(|| CoreError::not_found("enrollment", enrollment_id))
}

pub fn find_enrollment(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> CoreResult<Option<Enrollment>> {
    Ok(conn
        .query_row(
            "SELECT id, student_id, course_id, status, created_at
             FROM enrollments
             WHERE student_id = ? AND course_id = ?",
            (student_id, course_id),
            enrollment_from_row,
        )
        .optional()?)
}

/// The course after `course` in its category, by `sort_order`.
pub fn next_course_in_category(conn: &Connection, course: &Course) -> CoreResult<Option<Course>> {
    Ok(conn
        .query_row(
            "SELECT id, title, category, sort_order, lesson_count
             FROM courses
             WHERE category = ? AND sort_order > ?
             ORDER BY sort_order, id
             LIMIT 1",
            (&course.category, course.sort_order),
            course_from_row,
        )
        .optional()?)
}

pub fn create_user(
    conn: &Connection,
    id: Option<String>,
    display_name: &str,
    email: Option<&str>,
    role: Role,
    supervisor_id: Option<&str>,
) -> CoreResult<User> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(CoreError::validation("displayName must not be empty"));
    }
    if let Some(sup) = supervisor_id {
        let sup_user = load_user(conn, sup)?;
        if sup_user.role == Role::Student {
            return Err(CoreError::validation("supervisor must not be a student"));
        }
    }
    let id = id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(db::new_id);
    if find_user(conn, &id)?.is_some() {
        return Err(CoreError::validation(format!("user {} already exists", id)));
    }
    conn.execute(
        "INSERT INTO users(id, display_name, email, role, supervisor_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            display_name,
            email,
            role.as_str(),
            supervisor_id,
            db::now_stamp(),
        ),
    )?;
    load_user(conn, &id)
}

pub fn create_course(
    conn: &Connection,
    title: &str,
    category: &str,
    sort_order: Option<i64>,
) -> CoreResult<Course> {
    let title = title.trim();
    let category = category.trim();
    if title.is_empty() || category.is_empty() {
        return Err(CoreError::validation("title and category are required"));
    }
    let sort_order = match sort_order {
        Some(v) => v,
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM courses WHERE category = ?",
            [category],
            |r| r.get(0),
        )?,
    };
    let id = db::new_id();
    conn.execute(
        "INSERT INTO courses(id, title, category, sort_order, lesson_count) VALUES(?, ?, ?, ?, 0)",
        (&id, title, category, sort_order),
    )?;
    load_course(conn, &id)
}

/// Adds a lesson and keeps `courses.lesson_count` in step with it.
pub fn create_lesson(
    conn: &Connection,
    course_id: &str,
    title: &str,
    sort_order: Option<i64>,
) -> CoreResult<Lesson> {
    load_course(conn, course_id)?;
    let title = title.trim();
    if title.is_empty() {
        return Err(CoreError::validation("title must not be empty"));
    }
    let sort_order = match sort_order {
        Some(v) => v,
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM lessons WHERE course_id = ?",
            [course_id],
            |r| r.get(0),
        )?,
    };
    let taken: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM lessons WHERE course_id = ? AND sort_order = ?",
            (course_id, sort_order),
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(CoreError::validation(format!(
            "sortOrder {} already used in course",
            sort_order
        )));
    }
    let id = db::new_id();
    conn.execute(
        "INSERT INTO lessons(id, course_id, title, sort_order) VALUES(?, ?, ?, ?)",
        (&id, course_id, title, sort_order),
    )?;
    conn.execute(
        "UPDATE courses SET lesson_count = lesson_count + 1 WHERE id = ?",
        [course_id],
    )?;
    info!(course_id, lesson_id = %id, "lesson added");
    load_lesson(conn, &id)
}

pub fn create_question(
    conn: &Connection,
    lesson_id: &str,
    prompt: &str,
    sort_order: Option<i64>,
    requires_image: bool,
) -> CoreResult<Question> {
    load_lesson(conn, lesson_id)?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(CoreError::validation("prompt must not be empty"));
    }
    let sort_order = match sort_order {
        Some(v) => v,
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM questions WHERE lesson_id = ?",
            [lesson_id],
            |r| r.get(0),
        )?,
    };
    let id = db::new_id();
    conn.execute(
        "INSERT INTO questions(id, lesson_id, prompt, sort_order, requires_image)
         VALUES(?, ?, ?, ?, ?)",
        (&id, lesson_id, prompt, sort_order, requires_image as i64),
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CoreError::validation(format!("sortOrder {} already used in lesson", sort_order))
        }
        other => CoreError::Db(other),
    })?;
    Ok(Question {
        id,
        lesson_id: lesson_id.to_string(),
        prompt: prompt.to_string(),
        sort_order,
        requires_image,
    })
}

/// Inserts the enrollment unless the pair already has one; either way the
/// stored row is returned.
pub fn ensure_enrollment(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    status: EnrollmentStatus,
) -> CoreResult<(Enrollment, bool)> {
    let inserted = conn.execute(
        "INSERT INTO enrollments(id, student_id, course_id, status, created_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id) DO NOTHING",
        (
            db::new_id(),
            student_id,
            course_id,
            status.as_str(),
            db::now_stamp(),
        ),
    )?;
    let enrollment = find_enrollment(conn, student_id, course_id)?
        .ok_or_else(|| CoreError::not_found("enrollment", format!("{student_id}/{course_id}")))?;
    Ok((enrollment, inserted > 0))
}

pub fn create_enrollment(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
    status: EnrollmentStatus,
) -> CoreResult<Enrollment> {
    let student = load_user(conn, student_id)?;
    if student.role != Role::Student {
        return Err(CoreError::validation("only students can be enrolled"));
    }
    load_course(conn, course_id)?;
    let (enrollment, created) = ensure_enrollment(conn, student_id, course_id, status)?;
    if !created {
        return Err(CoreError::validation("student is already enrolled in this course"));
    }
    Ok(enrollment)
}

pub fn activate_enrollment(conn: &Connection, enrollment_id: &str) -> CoreResult<Enrollment> {
    let enrollment = load_enrollment(conn, enrollment_id)?;
    if enrollment.is_active() {
        return Ok(enrollment);
    }
    conn.execute(
        "UPDATE enrollments SET status = ? WHERE id = ?",
        (EnrollmentStatus::Active.as_str(), enrollment_id),
    )?;
    load_enrollment(conn, enrollment_id)
}
