use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::printing::ReportFormat;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    School,
    Reports,
    Attendance,
    Planner,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "reports" => Some(Self::Reports),
            "attendance" => Some(Self::Attendance),
            "planner" => Some(Self::Planner),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Reports => "setup.reports",
            Self::Attendance => "setup.attendance",
            Self::Planner => "setup.planner",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": "",
            "timezoneLabel": "UTC"
        }),
        SetupSection::Reports => json!({
            "defaultFormat": "pdf",
            "showGeneratedAt": true,
            "timestampedPaths": false
        }),
        SetupSection::Attendance => json!({
            "autoApproveNonTeacher": true
        }),
        SetupSection::Planner => json!({
            "defaultDurationMinutes": 60
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "timezoneLabel" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 40)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Reports => match k.as_str() {
                "defaultFormat" => {
                    let f = parse_string_max(v, k, 8)?.to_ascii_lowercase();
                    if ReportFormat::parse(&f).is_none() {
                        return Err("defaultFormat must be one of: pdf, html".into());
                    }
                    obj.insert(k.clone(), Value::String(f));
                }
                "showGeneratedAt" | "timestampedPaths" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown reports field: {}", k)),
            },
            SetupSection::Attendance => match k.as_str() {
                "autoApproveNonTeacher" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Planner => match k.as_str() {
                "defaultDurationMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 15, 240)?));
                }
                _ => return Err(format!("unknown planner field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub school_name: Option<String>,
    pub default_format: ReportFormat,
    pub show_generated_at: bool,
    pub timestamped_paths: bool,
}

pub fn report_settings(conn: &Connection) -> anyhow::Result<ReportSettings> {
    let school = load_section(conn, SetupSection::School)?;
    let reports = load_section(conn, SetupSection::Reports)?;
    Ok(ReportSettings {
        school_name: school
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
        default_format: reports
            .get("defaultFormat")
            .and_then(|v| v.as_str())
            .and_then(ReportFormat::parse)
            .unwrap_or(ReportFormat::Pdf),
        show_generated_at: reports
            .get("showGeneratedAt")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        timestamped_paths: reports
            .get("timestampedPaths")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    })
}

pub fn attendance_auto_approve(conn: &Connection) -> anyhow::Result<bool> {
    let section = load_section(conn, SetupSection::Attendance)?;
    Ok(section
        .get("autoApproveNonTeacher")
        .and_then(|v| v.as_bool())
        .unwrap_or(true))
}

pub fn planner_default_duration(conn: &Connection) -> anyhow::Result<i64> {
    let section = load_section(conn, SetupSection::Planner)?;
    Ok(section
        .get("defaultDurationMinutes")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0)
        .unwrap_or(60))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for (name, section) in [
        ("school", SetupSection::School),
        ("reports", SetupSection::Reports),
        ("attendance", SetupSection::Attendance),
        ("planner", SetupSection::Planner),
    ] {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(name.to_string(), v);
            }
            Err(e) => return err(&req.id, "unavailable", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let session = match crate::session::Session::resolve(conn, &req.params) {
        Ok(s) => s,
        Err(e) => return crate::ipc::error::app_err(&req.id, &e),
    };
    if let Err(e) = session.require_any(&[crate::models::Role::Headteacher], "change settings") {
        return crate::ipc::error::app_err(&req.id, &e);
    }
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "unavailable", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "unavailable", e.to_string(), None);
    }
    tracing::info!(section = section.key(), by = %session.user_id, "settings updated");
    ok(&req.id, json!({ "ok": true, "section": section_raw, "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
