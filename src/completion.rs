//! Course completion detection. `courses.lesson_count` is authoritative for
//! the comparison; lessons are not recounted here.

use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog;
use crate::certificates::{self, Certificate, CertificateStatus};
use crate::error::CoreResult;

pub fn passed_lesson_count(conn: &Connection, student_id: &str, course_id: &str) -> CoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*)
         FROM submissions s
         JOIN lessons l ON l.id = s.lesson_id
         WHERE s.student_id = ? AND l.course_id = ? AND s.status = 'graded_pass'",
        (student_id, course_id),
        |r| r.get(0),
    )?)
}

pub fn is_course_complete(conn: &Connection, student_id: &str, course_id: &str) -> CoreResult<bool> {
    let course = catalog::load_course(conn, course_id)?;
    if course.lesson_count <= 0 {
        return Ok(false);
    }
    Ok(passed_lesson_count(conn, student_id, course_id)? >= course.lesson_count)
}

/// Called after a lesson passes. Creates the pending certificate when the
/// course just became complete; returns the course's certificate if any.
pub fn on_lesson_passed(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> CoreResult<Option<Certificate>> {
    if !is_course_complete(conn, student_id, course_id)? {
        return Ok(None);
    }
    let (cert, _) = certificates::create_pending(conn, student_id, course_id)?;
    Ok(Some(cert))
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub complete: bool,
    pub removed_certificate_id: Option<String>,
    /// A live issued certificate that no longer matches the submissions.
    /// Kept; removing it goes through the confirmed delete path.
    pub stale_issued_certificate_id: Option<String>,
}

/// Re-run after submissions were removed or reopened. If the course is no
/// longer complete, any certificate still in approval and any back-entered
/// certificate goes with it.
pub fn reconcile_after_removal(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> CoreResult<Reconciliation> {
    let complete = is_course_complete(conn, student_id, course_id)?;
    let mut out = Reconciliation {
        complete,
        ..Default::default()
    };
    if complete {
        return Ok(out);
    }
    let Some(cert) = certificates::find_certificate(conn, student_id, course_id)? else {
        return Ok(out);
    };
    if cert.status != CertificateStatus::Issued || cert.is_backentered {
        certificates::remove_certificate(conn, &cert.id)?;
        info!(certificate_id = %cert.id, student_id, course_id, "certificate removed; course no longer complete");
        out.removed_certificate_id = Some(cert.id);
    } else {
        warn!(certificate_id = %cert.id, student_id, course_id, "issued certificate kept although course is no longer complete");
        out.stale_issued_certificate_id = Some(cert.id);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seed(conn: &Connection, lesson_count: i64) {
        conn.execute(
            "INSERT INTO users(id, display_name, role, created_at) VALUES('s1', 'Student', 'student', 'now')",
            [],
        )
        .expect("user");
        conn.execute(
            "INSERT INTO courses(id, title, category, sort_order, lesson_count) VALUES('c1', 'Course', 'cat', 0, ?)",
            [lesson_count],
        )
        .expect("course");
        for i in 0..2 {
            conn.execute(
                "INSERT INTO lessons(id, course_id, title, sort_order) VALUES(?, 'c1', 'L', ?)",
                (format!("l{}", i), i),
            )
            .expect("lesson");
        }
    }

    fn pass(conn: &Connection, lesson: &str) {
        conn.execute(
            "INSERT INTO submissions(id, student_id, lesson_id, status, grade, created_at)
             VALUES(?, 's1', ?, 'graded_pass', 100, 'now')",
            (format!("sub-{}", lesson), lesson),
        )
        .expect("submission");
    }

    #[test]
    fn completion_uses_lesson_count() {
        let conn = db::open_memory().expect("db");
        seed(&conn, 2);
        pass(&conn, "l0");
        assert!(!is_course_complete(&conn, "s1", "c1").expect("check"));
        pass(&conn, "l1");
        assert!(is_course_complete(&conn, "s1", "c1").expect("check"));
    }

    #[test]
    fn zero_lesson_course_is_never_complete() {
        let conn = db::open_memory().expect("db");
        seed(&conn, 0);
        pass(&conn, "l0");
        assert!(!is_course_complete(&conn, "s1", "c1").expect("check"));
    }

    #[test]
    fn repeated_detection_creates_one_certificate() {
        let conn = db::open_memory().expect("db");
        seed(&conn, 2);
        pass(&conn, "l0");
        pass(&conn, "l1");
        let a = on_lesson_passed(&conn, "s1", "c1").expect("first").expect("cert");
        let b = on_lesson_passed(&conn, "s1", "c1").expect("second").expect("cert");
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, CertificateStatus::PendingAttestation);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM certificates", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 1);
    }

    #[test]
    fn reconcile_keeps_live_issued_certificate() {
        let conn = db::open_memory().expect("db");
        seed(&conn, 2);
        pass(&conn, "l0");
        conn.execute(
            "INSERT INTO certificates(id, student_id, course_id, status, is_backentered, created_at)
             VALUES('cert1', 's1', 'c1', 'issued', 0, 'now')",
            [],
        )
        .expect("cert");
        let r = reconcile_after_removal(&conn, "s1", "c1").expect("reconcile");
        assert!(!r.complete);
        assert_eq!(r.stale_issued_certificate_id.as_deref(), Some("cert1"));
        assert!(r.removed_certificate_id.is_none());
    }
}
