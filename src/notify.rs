//! Best-effort side channel. Core operations collect `Dispatch` items while
//! they run; the caller delivers them only after the transaction commits,
//! and delivery failures are logged, never returned.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::{Actor, Role};
use crate::catalog;
use crate::db;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub user_id: String,
    pub kind: &'static str,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Notify(Notification),
    Email(Email),
}

/// Result of a core operation plus whatever it wants announced.
#[derive(Debug)]
pub struct Outcome {
    pub result: serde_json::Value,
    pub dispatches: Vec<Dispatch>,
}

impl Outcome {
    /// An outcome that announces nothing (back-entry, overrides, reads).
    pub fn silent(result: serde_json::Value) -> Self {
        Self {
            result,
            dispatches: Vec::new(),
        }
    }
}

pub trait Notifier {
    fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
    fn send_email(&self, email: &Email) -> anyhow::Result<()>;
}

/// Writes into the workspace `notifications` / `emails` tables, from which
/// the delivery service picks them up.
pub struct OutboxNotifier<'a> {
    conn: &'a Connection,
}

impl<'a> OutboxNotifier<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl Notifier for OutboxNotifier<'_> {
    fn notify(&self, n: &Notification) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO notifications(id, user_id, kind, title, message, link, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                db::new_id(),
                &n.user_id,
                n.kind,
                &n.title,
                &n.message,
                &n.link,
                db::now_stamp(),
            ),
        )?;
        Ok(())
    }

    fn send_email(&self, e: &Email) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO emails(id, recipient, subject, body, link, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                db::new_id(),
                &e.to,
                &e.subject,
                &e.body,
                &e.link,
                db::now_stamp(),
            ),
        )?;
        Ok(())
    }
}

pub struct LogOnlyNotifier;

impl Notifier for LogOnlyNotifier {
    fn notify(&self, n: &Notification) -> anyhow::Result<()> {
        debug!(user_id = %n.user_id, kind = n.kind, title = %n.title, "notification suppressed");
        Ok(())
    }

    fn send_email(&self, e: &Email) -> anyhow::Result<()> {
        debug!(to = %e.to, subject = %e.subject, "email suppressed");
        Ok(())
    }
}

fn absolute_link(base_url: &str, link: &Option<String>) -> Option<String> {
    link.as_ref().map(|l| format!("{}{}", base_url, l))
}

/// Delivers every item, returning how many were accepted.
pub fn dispatch_all(notifier: &dyn Notifier, items: Vec<Dispatch>, base_url: &str) -> usize {
    let mut delivered = 0;
    for item in items {
        let res = match item {
            Dispatch::Notify(mut n) => {
                n.link = absolute_link(base_url, &n.link);
                notifier
                    .notify(&n)
                    .map_err(|e| (format!("notify {} ({})", n.user_id, n.kind), e))
            }
            Dispatch::Email(mut e) => {
                e.link = absolute_link(base_url, &e.link);
                notifier
                    .send_email(&e)
                    .map_err(|err| (format!("email {}", e.to), err))
            }
        };
        match res {
            Ok(()) => delivered += 1,
            Err((target, e)) => warn!(target = %target, error = %e, "dispatch failed"),
        }
    }
    delivered
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredNotification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub created_at: String,
}

/// Outbox rows addressed to one user, newest first. Admins see anyone's.
pub fn list_for_user(conn: &Connection, actor: &Actor, user_id: &str) -> CoreResult<Outcome> {
    if actor.role != Role::Admin && actor.id != user_id {
        return Err(CoreError::not_authorized("notifications belong to another user"));
    }
    catalog::load_user(conn, user_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, kind, title, message, link, created_at
         FROM notifications
         WHERE user_id = ?
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map([user_id], |r| {
            Ok(StoredNotification {
                id: r.get(0)?,
                user_id: r.get(1)?,
                kind: r.get(2)?,
                title: r.get(3)?,
                message: r.get(4)?,
                link: r.get(5)?,
                created_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Outcome::silent(json!({ "notifications": rows })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FlakyNotifier {
        seen: RefCell<Vec<String>>,
    }

    impl Notifier for FlakyNotifier {
        fn notify(&self, n: &Notification) -> anyhow::Result<()> {
            self.seen.borrow_mut().push(n.link.clone().unwrap_or_default());
            Ok(())
        }

        fn send_email(&self, _e: &Email) -> anyhow::Result<()> {
            anyhow::bail!("smtp unavailable")
        }
    }

    #[test]
    fn failed_email_does_not_stop_later_items() {
        let notifier = FlakyNotifier {
            seen: RefCell::new(Vec::new()),
        };
        let items = vec![
            Dispatch::Email(Email {
                to: "s@example.org".to_string(),
                subject: "x".to_string(),
                body: "y".to_string(),
                link: None,
            }),
            Dispatch::Notify(Notification {
                user_id: "u1".to_string(),
                kind: "lesson_graded",
                title: "t".to_string(),
                message: "m".to_string(),
                link: Some("/lessons/l1".to_string()),
            }),
        ];
        let delivered = dispatch_all(&notifier, items, "https://school.example");
        assert_eq!(delivered, 1);
        assert_eq!(
            notifier.seen.borrow().as_slice(),
            ["https://school.example/lessons/l1".to_string()]
        );
    }

    #[test]
    fn outbox_writes_rows() {
        let conn = db::open_memory().expect("db");
        let outbox = OutboxNotifier::new(&conn);
        let delivered = dispatch_all(
            &outbox,
            vec![Dispatch::Notify(Notification {
                user_id: "u1".to_string(),
                kind: "certificate_issued",
                title: "Done".to_string(),
                message: "Congratulations".to_string(),
                link: None,
            })],
            "",
        );
        assert_eq!(delivered, 1);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications WHERE user_id = 'u1'", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 1);
    }
}
