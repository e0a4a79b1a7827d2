use crate::backentry::{self, BackEntryRequest};
use crate::error::CoreResult;
use crate::ipc::helpers::{get_optional_str, get_required_str, get_str_array, run_write};
use crate::ipc::types::{AppState, Request};
use crate::overrides;

fn parse_request(params: &serde_json::Value) -> CoreResult<BackEntryRequest> {
    Ok(BackEntryRequest {
        student_id: get_required_str(params, "studentId")?,
        course_id: get_required_str(params, "courseId")?,
        completed_at: get_optional_str(params, "completedAt")?,
        certificate_number: get_optional_str(params, "certificateNumber")?,
    })
}

fn handle_lessons(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let request = parse_request(&req.params)?;
        let lesson_ids = get_str_array(&req.params, "lessonIds")?;
        backentry::back_enter_lessons(conn, actor, &request, &lesson_ids)
    })
}

fn handle_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let request = parse_request(&req.params)?;
        backentry::back_enter_course(conn, actor, &request)
    })
}

fn handle_delete_submission(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let submission_id = get_required_str(&req.params, "submissionId")?;
        overrides::delete_backentered_submission(conn, actor, &submission_id)
    })
}

fn handle_delete_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let student_id = get_required_str(&req.params, "studentId")?;
        let course_id = get_required_str(&req.params, "courseId")?;
        overrides::delete_backentered_course(conn, actor, &student_id, &course_id)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backentry.lessons" => Some(handle_lessons(state, req)),
        "backentry.course" => Some(handle_course(state, req)),
        "backentry.deleteSubmission" => Some(handle_delete_submission(state, req)),
        "backentry.deleteCourse" => Some(handle_delete_course(state, req)),
        _ => None,
    }
}
