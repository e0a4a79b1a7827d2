mod auth;
mod backentry;
mod catalog;
mod certificates;
mod completion;
mod config;
mod db;
mod error;
mod grading;
mod ipc;
mod lifecycle;
mod notify;
mod overrides;

use std::io::{self, BufRead, Write};

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("coursed: {}", e);
            std::process::exit(2);
        }
    };

    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let mut state = ipc::AppState {
        config: config.clone(),
        workspace: None,
        db: None,
    };

    if let Some(path) = config.workspace.as_ref() {
        match db::open_db(path, config.busy_timeout) {
            Ok(conn) => {
                info!(workspace = %path.display(), "workspace opened");
                state.workspace = Some(path.clone());
                state.db = Some(conn);
            }
            Err(e) => tracing::error!(workspace = %path.display(), error = ?e, "failed to open workspace"),
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "coursed ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer to.
                let resp = ipc::error::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
