use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// When the request carries an actorRole, it must parse and carry the
/// school-management capability. Absent means the outer layer already gated.
pub(super) fn check_manage_role(req: &Request) -> Result<(), serde_json::Value> {
    let Some(raw) = req.params.get("actorRole").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    match Role::parse(raw) {
        Some(role) if role.can_manage_school() => Ok(()),
        Some(_) => Err(err(
            &req.id,
            "conflict",
            "insufficient permissions",
            Some(json!({ "actorRole": raw })),
        )),
        None => Err(err(
            &req.id,
            "bad_params",
            "actorRole must be one of ADMIN, TEACHER, STUDENT, PARENT",
            Some(json!({ "actorRole": raw })),
        )),
    }
}

pub(super) fn check_marking_role(req: &Request) -> Result<(), serde_json::Value> {
    let Some(raw) = req.params.get("actorRole").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    match Role::parse(raw) {
        Some(role) if role.can_record_marks() => Ok(()),
        Some(_) => Err(err(
            &req.id,
            "conflict",
            "insufficient permissions",
            Some(json!({ "actorRole": raw })),
        )),
        None => Err(err(
            &req.id,
            "bad_params",
            "actorRole must be one of ADMIN, TEACHER, STUDENT, PARENT",
            Some(json!({ "actorRole": raw })),
        )),
    }
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Include counts and the assigned teacher so the UI can show a dashboard.
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.year,
           t.first_name,
           t.last_name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         LEFT JOIN teachers t ON t.id = c.teacher_id
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let year: i64 = row.get(2)?;
            let t_first: Option<String> = row.get(3)?;
            let t_last: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            let teacher = match (t_first, t_last) {
                (Some(f), Some(l)) => json!(format!("{} {}", f, l)),
                _ => json!(null),
            };
            Ok(json!({
                "id": id,
                "name": name,
                "year": year,
                "teacher": teacher,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = check_manage_role(req) {
        return resp;
    }

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let year = match req.params.get("year").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing year", None),
    };
    let teacher_id = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if let Some(tid) = teacher_id.as_deref() {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [tid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "teacher not found", None);
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, year, teacher_id) VALUES(?, ?, ?, ?)",
        (&class_id, &name, year, &teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "name": name, "year": year }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        _ => None,
    }
}
