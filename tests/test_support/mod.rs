#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

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
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .env_remove("SCHOOLD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
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
    let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(Value::Null)
}

pub fn error_code(resp: &Value) -> String {
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false), "expected error: {}", resp);
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

pub fn id_of(v: &Value) -> String {
    v.get("id")
        .and_then(|x| x.as_str())
        .expect("document id")
        .to_string()
}

/// A running daemon with a selected workspace and a counter for request ids.
pub struct Sidecar {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    pub workspace: PathBuf,
    next_id: u64,
}

impl Sidecar {
    pub fn start(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Self {
            child,
            stdin,
            reader,
            workspace,
            next_id: 0,
        };
        let path = s.workspace.to_string_lossy().to_string();
        s.call_ok("workspace.select", json!({ "path": path }));
        s
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn call_ok(&mut self, method: &str, params: Value) -> Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    /// Calls `method` as `user_id`, merging the session into `params`.
    pub fn as_user(&mut self, user_id: &str, method: &str, mut params: Value) -> Value {
        params["session"] = json!({ "userId": user_id });
        self.call(method, params)
    }

    pub fn as_user_ok(&mut self, user_id: &str, method: &str, mut params: Value) -> Value {
        params["session"] = json!({ "userId": user_id });
        self.call_ok(method, params)
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.workspace);
    }
}

/// Ids of a small seeded school.
pub struct School {
    pub admin: String,
    pub head: String,
    pub teacher: String,
    pub students: Vec<String>,
    pub class_id: String,
    pub subject_id: String,
}

pub fn register(s: &mut Sidecar, session: Option<&str>, email: &str, name: &str, role: &str, extra: Value) -> String {
    let mut input = json!({ "email": email, "displayName": name, "role": role });
    if let (Some(obj), Some(more)) = (input.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            obj.insert(k.clone(), v.clone());
        }
    }
    let mut params = json!({ "input": input });
    if let Some(uid) = session {
        params["session"] = json!({ "userId": uid });
    }
    id_of(&s.call_ok("users.register", params))
}

/// Admin (bootstrap), headteacher, teacher, one class with `student_count`
/// students and one subject.
pub fn seed_school(s: &mut Sidecar, student_count: usize) -> School {
    let admin = register(s, None, "admin@school.test", "Ada Admin", "admin", json!({}));
    let head = register(s, Some(&admin), "head@school.test", "Hal Head", "headteacher", json!({}));
    let teacher = register(s, None, "teacher@school.test", "Tia Teacher", "teacher", json!({ "department": "Maths" }));

    let class = s.as_user_ok(&head, "classes.create", json!({ "input": { "name": "7A", "gradeLevel": "7" } }));
    let class_id = id_of(&class);
    let subject = s.as_user_ok(&head, "subjects.create", json!({ "input": { "name": "Mathematics", "code": "MATH" } }));
    let subject_id = id_of(&subject);

    let students = (0..student_count)
        .map(|i| {
            register(
                s,
                None,
                &format!("student{}@school.test", i),
                &format!("Student {}", i),
                "student",
                json!({ "classId": class_id }),
            )
        })
        .collect();

    School {
        admin,
        head,
        teacher,
        students,
        class_id,
        subject_id,
    }
}
