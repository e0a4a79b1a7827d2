use crate::auth::{require_role, Role};
use crate::catalog::{self, EnrollmentStatus};
use crate::error::CoreError;
use crate::ipc::helpers::{get_bool, get_optional_i64, get_optional_str, get_required_str, run_write};
use crate::ipc::types::{AppState, Request};
use crate::notify::Outcome;
use serde_json::json;

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        require_role(actor, &[Role::Admin])?;
        let p = &req.params;
        let role_raw = get_required_str(p, "role")?;
        let role = Role::parse(&role_raw)
            .ok_or_else(|| CoreError::bad_params("role must be one of: student, supervisor, admin"))?;
        let user = catalog::create_user(
            conn,
            get_optional_str(p, "id")?,
            &get_required_str(p, "displayName")?,
            get_optional_str(p, "email")?.as_deref(),
            role,
            get_optional_str(p, "supervisorId")?.as_deref(),
        )?;
        Ok(Outcome::silent(json!({ "user": user })))
    })
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        require_role(actor, &[Role::Admin])?;
        let p = &req.params;
        let course = catalog::create_course(
            conn,
            &get_required_str(p, "title")?,
            &get_required_str(p, "category")?,
            get_optional_i64(p, "sortOrder")?,
        )?;
        Ok(Outcome::silent(json!({ "course": course })))
    })
}

fn handle_lessons_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        require_role(actor, &[Role::Admin])?;
        let p = &req.params;
        let lesson = catalog::create_lesson(
            conn,
            &get_required_str(p, "courseId")?,
            &get_required_str(p, "title")?,
            get_optional_i64(p, "sortOrder")?,
        )?;
        Ok(Outcome::silent(json!({ "lesson": lesson })))
    })
}

fn handle_questions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        require_role(actor, &[Role::Admin])?;
        let p = &req.params;
        let question = catalog::create_question(
            conn,
            &get_required_str(p, "lessonId")?,
            &get_required_str(p, "prompt")?,
            get_optional_i64(p, "sortOrder")?,
            get_bool(p, "requiresImage")?,
        )?;
        Ok(Outcome::silent(json!({ "question": question })))
    })
}

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        require_role(actor, &[Role::Admin])?;
        let p = &req.params;
        let status = match get_optional_str(p, "status")? {
            None => EnrollmentStatus::Active,
            Some(raw) => EnrollmentStatus::parse(raw.trim()).ok_or_else(|| {
                CoreError::bad_params("status must be one of: active, pending_invoice_verification")
            })?,
        };
        let enrollment = catalog::create_enrollment(
            conn,
            &get_required_str(p, "studentId")?,
            &get_required_str(p, "courseId")?,
            status,
        )?;
        Ok(Outcome::silent(json!({ "enrollment": enrollment })))
    })
}

fn handle_enrollments_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        require_role(actor, &[Role::Admin])?;
        let enrollment =
            catalog::activate_enrollment(conn, &get_required_str(&req.params, "enrollmentId")?)?;
        Ok(Outcome::silent(json!({ "enrollment": enrollment })))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "lessons.create" => Some(handle_lessons_create(state, req)),
        "questions.create" => Some(handle_questions_create(state, req)),
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.activate" => Some(handle_enrollments_activate(state, req)),
        _ => None,
    }
}
