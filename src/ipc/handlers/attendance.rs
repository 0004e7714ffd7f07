use crate::calc;
use crate::error::{AppError, AppResult};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_bool, opt_str, patch, patched_opt_str, require_date,
    require_exists, require_hhmm, required_str, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{AttendanceRecord, AttendanceStatus, RecordType, Role};
use crate::session::Session;
use crate::store::{self, FilterOp, Query};
use rusqlite::Connection;
use serde_json::{json, Value};

const PATCHABLE: &[&str] = &["date", "startTime", "status", "notes"];

/// Conjunctive attendance filter shared by listing, summaries and reports.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub class_id: Option<String>,
    pub student_id: Option<String>,
    pub teacher_id: Option<String>,
    pub record_type: Option<RecordType>,
    pub is_approved: Option<bool>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl AttendanceFilter {
    pub fn from_value(f: &Value) -> AppResult<Self> {
        let record_type = match opt_str(f, "recordType")? {
            Some(s) => Some(
                RecordType::parse(&s)
                    .ok_or_else(|| AppError::validation("recordType must be student or teacher"))?,
            ),
            None => None,
        };
        let date_from = opt_str(f, "dateFrom")?;
        if let Some(d) = &date_from {
            require_date(d, "dateFrom")?;
        }
        let date_to = opt_str(f, "dateTo")?;
        if let Some(d) = &date_to {
            require_date(d, "dateTo")?;
        }
        Ok(Self {
            class_id: opt_str(f, "classId")?,
            student_id: opt_str(f, "studentId")?,
            teacher_id: opt_str(f, "teacherId")?,
            record_type,
            is_approved: opt_bool(f, "isApproved")?,
            date_from,
            date_to,
        })
    }

    /// Students only ever see their own student records.
    pub fn restrict_to(&mut self, session: &Session) {
        if session.is(Role::Student) {
            self.student_id = Some(session.user_id.clone());
            self.record_type = Some(RecordType::Student);
        }
    }

    fn to_query(&self) -> Query {
        let mut q = Query::new(store::ATTENDANCE)
            .eq_opt("classId", self.class_id.clone())
            .eq_opt("studentId", self.student_id.clone())
            .eq_opt("teacherId", self.teacher_id.clone())
            .eq_opt("recordType", self.record_type.map(RecordType::as_str))
            .eq_opt("isApproved", self.is_approved);
        if let Some(d) = &self.date_from {
            q = q.filter("date", FilterOp::Gte, d.as_str());
        }
        if let Some(d) = &self.date_to {
            q = q.filter("date", FilterOp::Lte, d.as_str());
        }
        q
    }
}

/// Matching records ordered by `(date, startTime)`; a missing start time
/// sorts before any time on the same day.
pub fn load_records(conn: &Connection, filter: &AttendanceFilter) -> AppResult<Vec<AttendanceRecord>> {
    let mut records: Vec<AttendanceRecord> = store::query_typed(conn, &filter.to_query())?;
    records.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.start_time.cmp(&b.start_time))
    });
    Ok(records)
}

fn parse_status(obj: &Value) -> AppResult<AttendanceStatus> {
    let raw = required_str(obj, "status")?;
    AttendanceStatus::parse(&raw)
        .ok_or_else(|| AppError::validation("status must be one of: present, absent, late, excused"))
}

fn attendance_record(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher, Role::Teacher], "record attendance")?;
    let inp = input(ctx.params)?;
    let record_type = RecordType::parse(&required_str(inp, "recordType")?)
        .ok_or_else(|| AppError::validation("recordType must be student or teacher"))?;
    let date = required_str(inp, "date")?;
    require_date(&date, "date")?;
    let start_time = opt_str(inp, "startTime")?;
    if let Some(t) = &start_time {
        require_hhmm(t, "startTime")?;
    }
    let status = parse_status(inp)?;

    let (class_id, student_id, teacher_id) = match record_type {
        RecordType::Student => {
            let class_id = required_str(inp, "classId")?;
            let student_id = required_str(inp, "studentId")?;
            require_exists(ctx.conn, store::CLASSES, &class_id, "class")?;
            require_exists(ctx.conn, store::USERS, &student_id, "student")?;
            (Some(class_id), Some(student_id), session.user_id.clone())
        }
        RecordType::Teacher => {
            let teacher_id = opt_str(inp, "teacherId")?.unwrap_or_else(|| session.user_id.clone());
            if teacher_id != session.user_id {
                session.require_any(&[Role::Headteacher], "record attendance for another teacher")?;
                require_exists(ctx.conn, store::USERS, &teacher_id, "teacher")?;
            }
            (opt_str(inp, "classId")?, None, teacher_id)
        }
    };

    let auto_approve = !session.is(Role::Teacher) && setup::attendance_auto_approve(ctx.conn)?;
    let now = store::now_iso();
    let record = AttendanceRecord {
        id: String::new(),
        record_type,
        class_id,
        student_id,
        teacher_id,
        date,
        start_time,
        status,
        notes: opt_str(inp, "notes")?,
        is_approved: auto_approve,
        approved_by: auto_approve.then(|| session.user_id.clone()),
        approved_at: auto_approve.then_some(now),
        recorded_by: session.user_id.clone(),
        created_at: String::new(),
        updated_at: String::new(),
    };
    let stored = store::insert_typed(ctx.conn, store::ATTENDANCE, &record)?;
    tracing::info!(
        record = %stored.id,
        kind = record_type.as_str(),
        approved = stored.is_approved,
        "attendance recorded"
    );
    Ok(json!(stored))
}

fn attendance_list(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let mut filter = AttendanceFilter::from_value(&filters(ctx.params)?)?;
    filter.restrict_to(session);
    let records = load_records(ctx.conn, &filter)?;
    Ok(json!({ "records": records }))
}

fn editable_record(ctx: &Ctx, session: &Session, action: &str) -> AppResult<AttendanceRecord> {
    let id = required_str(ctx.params, "id")?;
    let record: AttendanceRecord = store::require(ctx.conn, store::ATTENDANCE, &id, "attendance record")?;
    session.require_any(&[Role::Headteacher, Role::Teacher], action)?;
    session.require_owner_or_admin(&record.recorded_by, action)?;
    Ok(record)
}

fn attendance_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let p = patch(ctx.params, PATCHABLE)?;
    let mut record = editable_record(ctx, session, "edit this attendance record")?;
    if has_key(p, "date") {
        let date = required_str(p, "date")?;
        require_date(&date, "date")?;
        record.date = date;
    }
    record.start_time = patched_opt_str(p, "startTime", record.start_time)?;
    if let Some(t) = &record.start_time {
        require_hhmm(t, "startTime")?;
    }
    if has_key(p, "status") {
        record.status = parse_status(p)?;
    }
    record.notes = patched_opt_str(p, "notes", record.notes)?;

    // Teacher edits need fresh approval.
    if session.is(Role::Teacher) {
        record.is_approved = false;
        record.approved_by = None;
        record.approved_at = None;
    }
    let stored = store::replace_typed(ctx.conn, store::ATTENDANCE, &record.id, &record)?;
    tracing::info!(record = %stored.id, by = %session.user_id, "attendance updated");
    Ok(json!(stored))
}

fn attendance_approve(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "approve attendance")?;
    let id = required_str(ctx.params, "id")?;
    let mut record: AttendanceRecord = store::require(ctx.conn, store::ATTENDANCE, &id, "attendance record")?;
    record.is_approved = true;
    record.approved_by = Some(session.user_id.clone());
    record.approved_at = Some(store::now_iso());
    let stored = store::replace_typed(ctx.conn, store::ATTENDANCE, &id, &record)?;
    tracing::info!(record = %id, by = %session.user_id, "attendance approved");
    Ok(json!(stored))
}

fn attendance_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    if store::exists(ctx.conn, store::ATTENDANCE, &id)? {
        editable_record(ctx, session, "delete this attendance record")?;
    } else {
        session.require_any(&[Role::Headteacher, Role::Teacher], "delete attendance records")?;
    }
    let removed = store::delete(ctx.conn, store::ATTENDANCE, &id)?;
    tracing::info!(record = %id, by = %session.user_id, removed, "attendance delete");
    Ok(deleted(&id, removed))
}

fn attendance_summary(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let mut filter = AttendanceFilter::from_value(&filters(ctx.params)?)?;
    filter.restrict_to(session);
    let records = load_records(ctx.conn, &filter)?;
    Ok(json!(calc::attendance_summary(&records)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(with_session(state, req, attendance_record)),
        "attendance.list" => Some(with_session(state, req, attendance_list)),
        "attendance.update" => Some(with_session(state, req, attendance_update)),
        "attendance.approve" => Some(with_session(state, req, attendance_approve)),
        "attendance.delete" => Some(with_session(state, req, attendance_delete)),
        "attendance.summary" => Some(with_session(state, req, attendance_summary)),
        _ => None,
    }
}
