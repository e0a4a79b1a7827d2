mod test_support;

use serde_json::json;
use test_support::*;

fn issue(sc: &mut Sidecar, cert_id: &str) {
    let _ = sc.ok_as(
        officer(ATTESTER, &["attest"]),
        "certificates.attest",
        json!({ "certificateId": cert_id, "certificateNumber": "EXT-77" }),
    );
    let _ = sc.ok_as(officer(SEALER, &["seal"]), "certificates.seal", json!({ "certificateId": cert_id }));
}

/// Single-lesson course passed by `student_id`; returns (course, submission, certificate).
fn passed_course(sc: &mut Sidecar, student_id: &str, title: &str) -> (Course, String, String) {
    let course = seed_course(sc, title, "finance", &[&[false, false]]);
    enroll(sc, student_id, &course.id);
    let submission_id = answer_and_submit(sc, student_id, &course.lessons[0], &[false, false]);
    let graded = grade(sc, &submission_id, &[]);
    let cert_id = str_at(&graded, "/certificate/id").to_string();
    (course, submission_id, cert_id)
}

#[test]
fn revert_reopens_grading_and_drops_a_pending_certificate() {
    let mut sc = Sidecar::start("coursed-override-revert");
    seed_supervisor(&mut sc);
    seed_student(&mut sc, "stu-a");
    let (_course, submission_id, cert_id) = passed_course(&mut sc, "stu-a", "Ledgers");
    let notifications_before = count(&sc.db(), "SELECT COUNT(*) FROM notifications", []);

    let reverted = sc.ok_as(admin(), "submissions.revert", json!({ "submissionId": submission_id }));
    assert_eq!(str_at(&reverted, "/submission/status"), "submitted");
    assert!(reverted.pointer("/submission/grade").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(str_at(&reverted, "/reconciliation/removedCertificateId"), cert_id);

    let conn = sc.db();
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM answers WHERE submission_id = ?
               AND needs_correction IS NULL AND supervisor_feedback IS NULL AND answer_text <> ''",
            [&submission_id],
        ),
        2
    );
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM certificates", []), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM notifications", []), notifications_before);

    // Full regrade from scratch: nothing is locked.
    let open = sc.ok_as(supervisor(SUPERVISOR), "grading.open", json!({ "submissionId": submission_id }));
    assert!(open["items"]
        .as_array()
        .expect("items")
        .iter()
        .all(|i| i["locked"] == json!(false)));

    let e = sc.err_as(admin(), "submissions.revert", json!({ "submissionId": submission_id }));
    assert_eq!(code(&e), "invalid_state");
}

#[test]
fn reset_to_draft_clears_answers_and_keeps_an_issued_certificate() {
    let mut sc = Sidecar::start("coursed-override-reset");
    seed_supervisor(&mut sc);
    seed_student(&mut sc, "stu-a");
    let (_course, submission_id, cert_id) = passed_course(&mut sc, "stu-a", "Ledgers");
    issue(&mut sc, &cert_id);

    let reset = sc.ok_as(admin(), "submissions.resetDraft", json!({ "submissionId": submission_id }));
    assert_eq!(str_at(&reset, "/submission/status"), "draft");
    assert_eq!(str_at(&reset, "/reconciliation/staleIssuedCertificateId"), cert_id);

    let conn = sc.db();
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM answers WHERE submission_id = ? AND answer_text <> ''",
            [&submission_id],
        ),
        0
    );
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM certificates WHERE status = 'issued'", []),
        1
    );

    let e = sc.err_as(admin(), "submissions.resetDraft", json!({ "submissionId": submission_id }));
    assert_eq!(code(&e), "invalid_state");
    let e = sc.err_as(supervisor(SUPERVISOR), "submissions.revert", json!({ "submissionId": submission_id }));
    assert_eq!(code(&e), "not_authorized");
}

#[test]
fn changing_course_purges_the_vacated_records() {
    let mut sc = Sidecar::start("coursed-override-change");
    seed_supervisor(&mut sc);
    seed_student(&mut sc, "stu-a");
    let (course, _submission_id, cert_id) = passed_course(&mut sc, "stu-a", "Ledgers");
    let target = seed_course(&mut sc, "Invoicing", "finance", &[&[false]]);
    issue(&mut sc, &cert_id);
    let enrollment_id: String = sc
        .db()
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = 'stu-a' AND course_id = ?",
            [&course.id],
            |r| r.get(0),
        )
        .expect("enrollment");

    let e = sc.err_as(
        admin(),
        "enrollments.changeCourse",
        json!({ "enrollmentId": enrollment_id, "courseId": target.id }),
    );
    assert_eq!(code(&e), "validation_error");
    assert_eq!(count(&sc.db(), "SELECT COUNT(*) FROM certificates", []), 1);

    let moved = sc.ok_as(
        admin(),
        "enrollments.changeCourse",
        json!({ "enrollmentId": enrollment_id, "courseId": target.id, "confirmIssued": true }),
    );
    assert_eq!(str_at(&moved, "/enrollment/courseId"), target.id);
    assert_eq!(moved.get("deletedSubmissions"), Some(&json!(1)));
    assert_eq!(str_at(&moved, "/deletedCertificateId"), cert_id);

    let conn = sc.db();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM certificates", []), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM submissions", []), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM enrollments", []), 1);

    // The new course is open straight away.
    let _ = sc.ok_as(student("stu-a"), "lesson.open", json!({ "lessonId": target.lessons[0].id }));
}

#[test]
fn transfer_moves_the_seat_to_another_student() {
    let mut sc = Sidecar::start("coursed-override-transfer");
    seed_supervisor(&mut sc);
    seed_student(&mut sc, "stu-a");
    seed_student(&mut sc, "stu-b");
    let course = seed_course(&mut sc, "Ledgers", "finance", &[&[false]]);
    let enrollment_id = enroll(&mut sc, "stu-a", &course.id);
    let _ = answer_and_submit(&mut sc, "stu-a", &course.lessons[0], &[false]);

    let moved = sc.ok_as(
        admin(),
        "enrollments.transfer",
        json!({ "enrollmentId": enrollment_id, "studentId": "stu-b" }),
    );
    assert_eq!(str_at(&moved, "/enrollment/studentId"), "stu-b");
    assert_eq!(moved.get("deletedSubmissions"), Some(&json!(1)));

    let e = sc.err_as(student("stu-a"), "lesson.open", json!({ "lessonId": course.lessons[0].id }));
    assert_eq!(code(&e), "not_authorized");
    let opened = sc.ok_as(student("stu-b"), "lesson.open", json!({ "lessonId": course.lessons[0].id }));
    assert_eq!(str_at(&opened, "/submission/status"), "draft");
}

#[test]
fn merge_keeps_target_records_and_moves_the_rest() {
    let mut sc = Sidecar::start("coursed-override-merge");
    seed_supervisor(&mut sc);
    seed_student(&mut sc, "stu-old");
    seed_student(&mut sc, "stu-new");

    // Both profiles studied the shared course; only the old one took the other.
    let shared = seed_course(&mut sc, "Ledgers", "finance", &[&[false]]);
    enroll(&mut sc, "stu-old", &shared.id);
    enroll(&mut sc, "stu-new", &shared.id);
    let old_shared = answer_and_submit(&mut sc, "stu-old", &shared.lessons[0], &[false]);
    let _ = grade(&mut sc, &old_shared, &[]);
    let new_shared = answer_and_submit(&mut sc, "stu-new", &shared.lessons[0], &[false]);
    let (only_old, only_old_submission, only_old_cert) = passed_course(&mut sc, "stu-old", "Invoicing");

    let e = sc.err_as(admin(), "profiles.merge", json!({ "sourceId": "stu-old", "targetId": SUPERVISOR }));
    assert_eq!(code(&e), "validation_error");
    let e = sc.err_as(admin(), "profiles.merge", json!({ "sourceId": "stu-old", "targetId": "stu-old" }));
    assert_eq!(code(&e), "validation_error");

    let merged = sc.ok_as(admin(), "profiles.merge", json!({ "sourceId": "stu-old", "targetId": "stu-new" }));
    assert_eq!(merged.get("movedCourseIds"), Some(&json!([only_old.id])));
    assert_eq!(merged.get("discardedCourseIds"), Some(&json!([shared.id])));

    let conn = sc.db();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM users WHERE id = 'stu-old'", []), 0);
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM submissions WHERE student_id = 'stu-old'", []),
        0
    );
    // Target's own work on the shared course wins, still ungraded.
    let status: String = conn
        .query_row("SELECT status FROM submissions WHERE id = ?", [&new_shared], |r| r.get(0))
        .expect("target submission");
    assert_eq!(status, "submitted");
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM submissions WHERE id = ?", [&old_shared]),
        0
    );
    let owner: String = conn
        .query_row(
            "SELECT student_id FROM submissions WHERE id = ?",
            [&only_old_submission],
            |r| r.get(0),
        )
        .expect("moved submission");
    assert_eq!(owner, "stu-new");
    let cert_owner: String = conn
        .query_row("SELECT student_id FROM certificates WHERE id = ?", [&only_old_cert], |r| r.get(0))
        .expect("moved certificate");
    assert_eq!(cert_owner, "stu-new");
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM certificates WHERE student_id = 'stu-new'", []),
        1
    );
}

#[test]
fn failed_merge_leaves_the_source_profile_untouched() {
    let mut sc = Sidecar::start("coursed-override-merge-rollback");
    seed_supervisor(&mut sc);
    seed_student(&mut sc, "stu-old");
    seed_student(&mut sc, "stu-new");
    let (course, submission_id, cert_id) = passed_course(&mut sc, "stu-old", "Invoicing");

    // Deleting the source user is the merge's last write.
    sc.db()
        .execute_batch(
            "CREATE TRIGGER block_user_delete BEFORE DELETE ON users
             BEGIN SELECT RAISE(ABORT, 'user rows are locked'); END;",
        )
        .expect("create trigger");

    let e = sc.err_as(admin(), "profiles.merge", json!({ "sourceId": "stu-old", "targetId": "stu-new" }));
    assert_eq!(code(&e), "db_error");

    let conn = sc.db();
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM users WHERE id = 'stu-old'", []), 1);
    let owner: String = conn
        .query_row("SELECT student_id FROM submissions WHERE id = ?", [&submission_id], |r| r.get(0))
        .expect("submission");
    assert_eq!(owner, "stu-old");
    let cert_owner: String = conn
        .query_row("SELECT student_id FROM certificates WHERE id = ?", [&cert_id], |r| r.get(0))
        .expect("certificate");
    assert_eq!(cert_owner, "stu-old");
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM enrollments WHERE student_id = 'stu-old' AND course_id = ?",
            [&course.id],
        ),
        1
    );
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM enrollments WHERE student_id = 'stu-new'", []),
        0
    );

    conn.execute_batch("DROP TRIGGER block_user_delete").expect("drop trigger");
    let merged = sc.ok_as(admin(), "profiles.merge", json!({ "sourceId": "stu-old", "targetId": "stu-new" }));
    assert_eq!(merged.get("movedCourseIds"), Some(&json!([course.id])));
}
