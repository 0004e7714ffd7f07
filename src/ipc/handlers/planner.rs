use crate::error::{AppError, AppResult};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    deleted, filters, has_key, input, opt_i64, opt_str, patch, patched_opt_str, patched_str,
    require_date, require_exists, required_str, string_list, with_session, Ctx,
};
use crate::ipc::types::{AppState, Request};
use crate::models::{Activity, LessonPlan, LessonPlanStatus, Role};
use crate::session::Session;
use crate::store::{self, FilterOp, Query};
use serde_json::{json, Value};

const PATCHABLE: &[&str] = &[
    "classId",
    "subjectId",
    "title",
    "date",
    "durationMinutes",
    "objectives",
    "materials",
    "activities",
    "homework",
];

fn required_list(obj: &Value, key: &str) -> AppResult<Vec<String>> {
    let items = string_list(obj, key)?.unwrap_or_default();
    if items.is_empty() {
        return Err(AppError::validation(format!("{} must contain at least one item", key)));
    }
    Ok(items)
}

fn parse_duration(obj: &Value, default: i64) -> AppResult<i64> {
    match opt_i64(obj, "durationMinutes")? {
        Some(v) if v > 0 => Ok(v),
        Some(_) => Err(AppError::validation("durationMinutes must be > 0")),
        None => Ok(default),
    }
}

/// Activities keep their submitted order.
fn parse_activities(obj: &Value) -> AppResult<Vec<Activity>> {
    let Some(raw) = obj.get("activities").filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let activities: Vec<Activity> = serde_json::from_value(raw.clone()).map_err(|e| {
        AppError::validation(format!("activities are invalid: {}", e))
    })?;
    for a in &activities {
        if a.description.trim().is_empty() {
            return Err(AppError::validation("activity description must not be empty"));
        }
        if a.duration_minutes < 0 {
            return Err(AppError::validation("activity durationMinutes must be >= 0"));
        }
    }
    Ok(activities)
}

fn plans_create(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher, Role::Teacher], "create lesson plans")?;
    let inp = input(ctx.params)?;
    let class_id = required_str(inp, "classId")?;
    let subject_id = required_str(inp, "subjectId")?;
    require_exists(ctx.conn, store::CLASSES, &class_id, "class")?;
    require_exists(ctx.conn, store::SUBJECTS, &subject_id, "subject")?;
    let date = required_str(inp, "date")?;
    require_date(&date, "date")?;

    let teacher_id = match opt_str(inp, "teacherId")? {
        Some(t) if t != session.user_id => {
            session.require_any(&[Role::Headteacher], "plan lessons for another teacher")?;
            require_exists(ctx.conn, store::USERS, &t, "teacher")?;
            t
        }
        _ => session.user_id.clone(),
    };

    let plan = LessonPlan {
        id: String::new(),
        teacher_id,
        class_id,
        subject_id,
        title: required_str(inp, "title")?,
        date,
        duration_minutes: parse_duration(inp, setup::planner_default_duration(ctx.conn)?)?,
        objectives: required_list(inp, "objectives")?,
        materials: required_list(inp, "materials")?,
        activities: parse_activities(inp)?,
        homework: opt_str(inp, "homework")?,
        status: LessonPlanStatus::Draft,
        feedback: None,
        reviewed_by: None,
        reviewed_at: None,
        created_at: String::new(),
        updated_at: String::new(),
    };
    let stored = store::insert_typed(ctx.conn, store::LESSON_PLANS, &plan)?;
    tracing::info!(plan = %stored.id, teacher = %stored.teacher_id, "lesson plan created");
    Ok(json!(stored))
}

fn staff_only(session: &Session) -> AppResult<()> {
    session.require_any(&[Role::Headteacher, Role::Teacher], "read lesson plans")
}

fn plans_get(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    staff_only(session)?;
    let id = required_str(ctx.params, "id")?;
    let plan: LessonPlan = store::require(ctx.conn, store::LESSON_PLANS, &id, "lesson plan")?;
    Ok(json!(plan))
}

fn plans_list(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    staff_only(session)?;
    let f = filters(ctx.params)?;
    let status = match opt_str(&f, "status")? {
        Some(s) => Some(
            LessonPlanStatus::parse(&s)
                .ok_or_else(|| AppError::validation("status must be one of: draft, completed, reviewed"))?
                .as_str(),
        ),
        None => None,
    };
    let mut q = Query::new(store::LESSON_PLANS)
        .eq_opt("teacherId", opt_str(&f, "teacherId")?)
        .eq_opt("classId", opt_str(&f, "classId")?)
        .eq_opt("subjectId", opt_str(&f, "subjectId")?)
        .eq_opt("status", status);
    if let Some(d) = opt_str(&f, "dateFrom")? {
        require_date(&d, "dateFrom")?;
        q = q.filter("date", FilterOp::Gte, d);
    }
    if let Some(d) = opt_str(&f, "dateTo")? {
        require_date(&d, "dateTo")?;
        q = q.filter("date", FilterOp::Lte, d);
    }
    let mut plans: Vec<LessonPlan> = store::query_typed(ctx.conn, &q)?;
    plans.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.title.cmp(&b.title)));
    Ok(json!({ "lessonPlans": plans }))
}

fn owned_plan(ctx: &Ctx, session: &Session, action: &str) -> AppResult<LessonPlan> {
    let id = required_str(ctx.params, "id")?;
    let plan: LessonPlan = store::require(ctx.conn, store::LESSON_PLANS, &id, "lesson plan")?;
    staff_only(session)?;
    session.require_owner_or_admin(&plan.teacher_id, action)?;
    Ok(plan)
}

fn plans_update(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let p = patch(ctx.params, PATCHABLE)?;
    let mut plan = owned_plan(ctx, session, "edit this lesson plan")?;
    if plan.status != LessonPlanStatus::Draft {
        return Err(AppError::conflict(format!(
            "lesson plan is {} and can no longer be edited",
            plan.status.as_str()
        )));
    }

    if has_key(p, "classId") {
        let class_id = required_str(p, "classId")?;
        require_exists(ctx.conn, store::CLASSES, &class_id, "class")?;
        plan.class_id = class_id;
    }
    if has_key(p, "subjectId") {
        let subject_id = required_str(p, "subjectId")?;
        require_exists(ctx.conn, store::SUBJECTS, &subject_id, "subject")?;
        plan.subject_id = subject_id;
    }
    plan.title = patched_str(p, "title", plan.title)?;
    if has_key(p, "date") {
        let date = required_str(p, "date")?;
        require_date(&date, "date")?;
        plan.date = date;
    }
    plan.duration_minutes = parse_duration(p, plan.duration_minutes)?;
    if has_key(p, "objectives") {
        plan.objectives = required_list(p, "objectives")?;
    }
    if has_key(p, "materials") {
        plan.materials = required_list(p, "materials")?;
    }
    if has_key(p, "activities") {
        plan.activities = parse_activities(p)?;
    }
    plan.homework = patched_opt_str(p, "homework", plan.homework)?;

    let stored = store::replace_typed(ctx.conn, store::LESSON_PLANS, &plan.id, &plan)?;
    tracing::info!(plan = %stored.id, by = %session.user_id, "lesson plan updated");
    Ok(json!(stored))
}

fn plans_complete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let mut plan = owned_plan(ctx, session, "complete this lesson plan")?;
    match plan.status {
        LessonPlanStatus::Completed => return Ok(json!(plan)),
        LessonPlanStatus::Reviewed => {
            return Err(AppError::conflict("lesson plan has already been reviewed"))
        }
        LessonPlanStatus::Draft => {}
    }
    plan.status = LessonPlanStatus::Completed;
    let stored = store::replace_typed(ctx.conn, store::LESSON_PLANS, &plan.id, &plan)?;
    tracing::info!(plan = %stored.id, by = %session.user_id, "lesson plan completed");
    Ok(json!(stored))
}

/// Reviewing an already reviewed plan replaces the feedback and stamp.
fn plans_review(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    session.require_any(&[Role::Headteacher], "review lesson plans")?;
    let id = required_str(ctx.params, "id")?;
    let mut plan: LessonPlan = store::require(ctx.conn, store::LESSON_PLANS, &id, "lesson plan")?;
    plan.status = LessonPlanStatus::Reviewed;
    plan.feedback = opt_str(ctx.params, "feedback")?.or(plan.feedback);
    plan.reviewed_by = Some(session.user_id.clone());
    plan.reviewed_at = Some(store::now_iso());
    let stored = store::replace_typed(ctx.conn, store::LESSON_PLANS, &id, &plan)?;
    tracing::info!(plan = %id, by = %session.user_id, "lesson plan reviewed");
    Ok(json!(stored))
}

fn plans_delete(ctx: &Ctx, session: &Session) -> AppResult<Value> {
    let id = required_str(ctx.params, "id")?;
    if store::exists(ctx.conn, store::LESSON_PLANS, &id)? {
        owned_plan(ctx, session, "delete this lesson plan")?;
    } else {
        staff_only(session)?;
    }
    let removed = store::delete(ctx.conn, store::LESSON_PLANS, &id)?;
    tracing::info!(plan = %id, by = %session.user_id, removed, "lesson plan delete");
    Ok(deleted(&id, removed))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "lessonPlans.create" => Some(with_session(state, req, plans_create)),
        "lessonPlans.get" => Some(with_session(state, req, plans_get)),
        "lessonPlans.list" => Some(with_session(state, req, plans_list)),
        "lessonPlans.update" => Some(with_session(state, req, plans_update)),
        "lessonPlans.complete" => Some(with_session(state, req, plans_complete)),
        "lessonPlans.review" => Some(with_session(state, req, plans_review)),
        "lessonPlans.delete" => Some(with_session(state, req, plans_delete)),
        _ => None,
    }
}
