#![allow(dead_code)]

use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ADMIN: &str = "admin-1";
pub const SUPERVISOR: &str = "sup-1";
pub const ATTESTER: &str = "officer-attest";
pub const SEALER: &str = "officer-seal";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with_env(&[])
}

pub fn spawn_sidecar_with_env(env: &[(&str, &str)]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_coursed");
    let mut cmd = Command::new(exe);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("COURSED_WORKSPACE")
        .env_remove("COURSED_NOTIFICATIONS")
        .env_remove("COURSED_PUBLIC_BASE_URL");
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn coursed");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

pub fn admin() -> serde_json::Value {
    json!({ "id": ADMIN, "role": "admin" })
}

pub fn supervisor(id: &str) -> serde_json::Value {
    json!({ "id": id, "role": "supervisor" })
}

pub fn student(id: &str) -> serde_json::Value {
    json!({ "id": id, "role": "student" })
}

pub fn officer(id: &str, capabilities: &[&str]) -> serde_json::Value {
    json!({ "id": id, "role": "supervisor", "capabilities": capabilities })
}

/// One running sidecar bound to a fresh workspace. Numbers request ids.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: PathBuf,
}

impl Sidecar {
    pub fn start(prefix: &str) -> Self {
        Self::start_with_env(prefix, &[])
    }

    pub fn start_with_env(prefix: &str, env: &[(&str, &str)]) -> Self {
        Self::open(temp_dir(prefix), env)
    }

    /// Another process on a workspace that is already in use.
    pub fn attach(workspace: &Path) -> Self {
        Self::open(workspace.to_path_buf(), &[])
    }

    fn open(workspace: PathBuf, env: &[(&str, &str)]) -> Self {
        let (child, stdin, reader) = spawn_sidecar_with_env(env);
        let mut sc = Sidecar {
            child,
            stdin,
            reader,
            next_id: 0,
            workspace,
        };
        let path = sc.workspace.to_string_lossy().to_string();
        let _ = sc.ok("workspace.select", json!({ "path": path }));
        sc
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Raw response envelope.
    pub fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    /// Calls as `actor`; `params` must be an object.
    pub fn ok_as(
        &mut self,
        actor: serde_json::Value,
        method: &str,
        mut params: serde_json::Value,
    ) -> serde_json::Value {
        params["actor"] = actor;
        self.ok(method, params)
    }

    /// Expects a failure and returns the error object.
    pub fn err_as(
        &mut self,
        actor: serde_json::Value,
        method: &str,
        mut params: serde_json::Value,
    ) -> serde_json::Value {
        params["actor"] = actor;
        let value = self.call(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value.get("error").cloned().expect("error object")
    }

    pub fn db(&self) -> Connection {
        open_workspace_db(&self.workspace)
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn open_workspace_db(workspace: &Path) -> Connection {
    Connection::open(workspace.join("coursed.sqlite3")).expect("open workspace db")
}

pub fn code(error: &serde_json::Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, value))
}

/// Catalog seeded through the wire: one supervisor, one course with the
/// given lessons (each a list of `requiresImage` flags per question).
pub struct Course {
    pub id: String,
    pub lessons: Vec<SeededLesson>,
}

pub struct SeededLesson {
    pub id: String,
    pub question_ids: Vec<String>,
}

pub fn seed_supervisor(sc: &mut Sidecar) {
    let _ = sc.ok_as(
        admin(),
        "users.create",
        json!({ "id": SUPERVISOR, "displayName": "Sam Supervisor", "email": "sam@example.org", "role": "supervisor" }),
    );
}

pub fn seed_student(sc: &mut Sidecar, id: &str) {
    let _ = sc.ok_as(
        admin(),
        "users.create",
        json!({
            "id": id,
            "displayName": format!("Student {}", id),
            "email": format!("{}@example.org", id),
            "role": "student",
            "supervisorId": SUPERVISOR,
        }),
    );
}

pub fn seed_course(sc: &mut Sidecar, title: &str, category: &str, lessons: &[&[bool]]) -> Course {
    let course = sc.ok_as(
        admin(),
        "courses.create",
        json!({ "title": title, "category": category }),
    );
    let course_id = str_at(&course, "/course/id").to_string();
    let mut seeded = Vec::new();
    for (i, questions) in lessons.iter().enumerate() {
        let lesson = sc.ok_as(
            admin(),
            "lessons.create",
            json!({ "courseId": course_id, "title": format!("Lesson {}", i + 1) }),
        );
        let lesson_id = str_at(&lesson, "/lesson/id").to_string();
        let mut question_ids = Vec::new();
        for (j, requires_image) in questions.iter().enumerate() {
            let q = sc.ok_as(
                admin(),
                "questions.create",
                json!({
                    "lessonId": lesson_id,
                    "prompt": format!("Question {}.{}", i + 1, j + 1),
                    "requiresImage": requires_image,
                }),
            );
            question_ids.push(str_at(&q, "/question/id").to_string());
        }
        seeded.push(SeededLesson {
            id: lesson_id,
            question_ids,
        });
    }
    Course {
        id: course_id,
        lessons: seeded,
    }
}

pub fn enroll(sc: &mut Sidecar, student_id: &str, course_id: &str) -> String {
    let e = sc.ok_as(
        admin(),
        "enrollments.create",
        json!({ "studentId": student_id, "courseId": course_id }),
    );
    str_at(&e, "/enrollment/id").to_string()
}

/// Answers every question (uploading an image where required) and submits.
/// Returns the submission id.
pub fn answer_and_submit(sc: &mut Sidecar, student_id: &str, lesson: &SeededLesson, requires_image: &[bool]) -> String {
    let opened = sc.ok_as(student(student_id), "lesson.open", json!({ "lessonId": lesson.id }));
    let answers: Vec<serde_json::Value> = lesson
        .question_ids
        .iter()
        .map(|q| json!({ "questionId": q, "text": format!("answer to {}", q) }))
        .collect();
    let _ = sc.ok_as(
        student(student_id),
        "answers.save",
        json!({ "lessonId": lesson.id, "answers": answers }),
    );
    for (q, needs_image) in lesson.question_ids.iter().zip(requires_image) {
        if *needs_image {
            let _ = sc.ok_as(
                student(student_id),
                "answers.attachImage",
                json!({ "lessonId": lesson.id, "questionId": q, "imagePath": format!("blob://{}", q) }),
            );
        }
    }
    let _ = sc.ok_as(student(student_id), "submission.submit", json!({ "lessonId": lesson.id }));
    str_at(&opened, "/submission/id").to_string()
}

/// Answer ids of the submission keyed by question id.
pub fn answer_ids(sc: &Sidecar, submission_id: &str) -> Vec<(String, String)> {
    let conn = sc.db();
    let mut stmt = conn
        .prepare("SELECT question_id, id FROM answers WHERE submission_id = ? ORDER BY question_id")
        .expect("prepare");
    let rows = stmt
        .query_map([submission_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    rows
}

/// Grades with `wrong` question ids marked for correction, everything else
/// unlocked marked correct.
pub fn grade(sc: &mut Sidecar, submission_id: &str, wrong: &[&str]) -> serde_json::Value {
    let open = sc.ok_as(
        supervisor(SUPERVISOR),
        "grading.open",
        json!({ "submissionId": submission_id }),
    );
    let items = open
        .get("items")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let verdicts: Vec<serde_json::Value> = items
        .iter()
        .filter(|item| item.get("locked").and_then(|v| v.as_bool()) == Some(false))
        .filter_map(|item| {
            let answer_id = item.pointer("/answer/id")?.as_str()?.to_string();
            let question_id = item.pointer("/question/id")?.as_str()?.to_string();
            let wrong = wrong.contains(&question_id.as_str());
            Some(json!({
                "answerId": answer_id,
                "needsCorrection": wrong,
                "feedback": if wrong { "please revise" } else { "good" },
            }))
        })
        .collect();
    sc.ok_as(
        supervisor(SUPERVISOR),
        "grading.submit",
        json!({ "submissionId": submission_id, "verdicts": verdicts }),
    )
}

pub fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> i64 {
    conn.query_row(sql, params, |r| r.get(0)).expect("count")
}
