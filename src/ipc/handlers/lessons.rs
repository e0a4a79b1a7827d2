use crate::error::{CoreError, CoreResult};
use crate::ipc::helpers::{get_optional_str, get_required_str, run_read, run_write};
use crate::ipc::types::{AppState, Request};
use crate::lifecycle;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerInput {
    question_id: String,
    #[serde(default)]
    text: String,
}

fn parse_answers(params: &serde_json::Value) -> CoreResult<Vec<(String, String)>> {
    let Some(raw) = params.get("answers") else {
        return Err(CoreError::bad_params("missing answers"));
    };
    let inputs: Vec<AnswerInput> = serde_json::from_value(raw.clone())
        .map_err(|e| CoreError::bad_params(format!("answers: {}", e)))?;
    Ok(inputs
        .into_iter()
        .map(|a| (a.question_id, a.text))
        .collect())
}

fn handle_lesson_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        lifecycle::open_lesson(conn, actor, &lesson_id)
    })
}

fn handle_answers_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        let pairs = parse_answers(&req.params)?;
        lifecycle::save_answers(conn, actor, &lesson_id, &pairs)
    })
}

fn handle_answers_attach_image(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        let question_id = get_required_str(&req.params, "questionId")?;
        // null clears the attachment
        let image_path = get_optional_str(&req.params, "imagePath")?;
        lifecycle::attach_image(
            conn,
            actor,
            &lesson_id,
            &question_id,
            image_path.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        )
    })
}

fn handle_submission_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_write(state, req, |conn, actor| {
        let lesson_id = get_required_str(&req.params, "lessonId")?;
        lifecycle::submit_lesson(conn, actor, &lesson_id)
    })
}

fn handle_submission_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_read(state, req, |conn, actor| {
        let submission_id = get_required_str(&req.params, "submissionId")?;
        lifecycle::get_submission(conn, actor, &submission_id)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lesson.open" => Some(handle_lesson_open(state, req)),
        "answers.save" => Some(handle_answers_save(state, req)),
        "answers.attachImage" => Some(handle_answers_attach_image(state, req)),
        "submission.submit" => Some(handle_submission_submit(state, req)),
        "submission.get" => Some(handle_submission_get(state, req)),
        _ => None,
    }
}
