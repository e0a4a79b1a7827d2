use crate::ipc::helpers::{get_bool, get_required_str, run_write};
use crate::ipc::types::{AppState, Request};
use crate::overrides;

fn handle_revert(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let submission_id = get_required_str(&req.params, "submissionId")?;
        overrides::revert_to_submitted(conn, actor, &submission_id)
    })
}

fn handle_reset_draft(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let submission_id = get_required_str(&req.params, "submissionId")?;
        overrides::reset_to_draft(conn, actor, &submission_id)
    })
}

fn handle_change_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let enrollment_id = get_required_str(&req.params, "enrollmentId")?;
        let course_id = get_required_str(&req.params, "courseId")?;
        let confirm = get_bool(&req.params, "confirmIssued")?;
        overrides::change_enrollment_course(conn, actor, &enrollment_id, &course_id, confirm)
    })
}

fn handle_transfer(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let enrollment_id = get_required_str(&req.params, "enrollmentId")?;
        let student_id = get_required_str(&req.params, "studentId")?;
        let confirm = get_bool(&req.params, "confirmIssued")?;
        overrides::transfer_enrollment(conn, actor, &enrollment_id, &student_id, confirm)
    })
}

fn handle_merge(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let source_id = get_required_str(&req.params, "sourceId")?;
        let target_id = get_required_str(&req.params, "targetId")?;
        overrides::merge_profiles(conn, actor, &source_id, &target_id)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.revert" => Some(handle_revert(state, req)),
        "submissions.resetDraft" => Some(handle_reset_draft(state, req)),
        "enrollments.changeCourse" => Some(handle_change_course(state, req)),
        "enrollments.transfer" => Some(handle_transfer(state, req)),
        "profiles.merge" => Some(handle_merge(state, req)),
        _ => None,
    }
}
