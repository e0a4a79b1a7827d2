use crate::error::CoreError;
use crate::grading::{self, Verdict};
use crate::ipc::helpers::{get_required_str, run_read, run_write};
use crate::ipc::types::{AppState, Request};

fn handle_queue(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_read(state, req, |conn, actor| grading::grading_queue(conn, actor))
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_read(state, req, |conn, actor| {
        let submission_id = get_required_str(&req.params, "submissionId")?;
        grading::grading_open(conn, actor, &submission_id)
    })
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let submission_id = get_required_str(&req.params, "submissionId")?;
        let Some(raw) = req.params.get("verdicts") else {
            return Err(CoreError::bad_params("missing verdicts"));
        };
        let verdicts: Vec<Verdict> = serde_json::from_value(raw.clone())
            .map_err(|e| CoreError::bad_params(format!("verdicts: {}", e)))?;
        grading::grade_submission(conn, actor, &submission_id, &verdicts)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grading.queue" => Some(handle_queue(state, req)),
        "grading.open" => Some(handle_open(state, req)),
        "grading.submit" => Some(handle_submit(state, req)),
        _ => None,
    }
}
