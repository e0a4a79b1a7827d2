use crate::ipc::helpers::{get_required_str, run_read};
use crate::ipc::types::{AppState, Request};
use crate::notify;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    run_read(state, req, |conn, actor| {
        let user_id = get_required_str(&req.params, "userId")?;
        notify::list_for_user(conn, actor, &user_id)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
