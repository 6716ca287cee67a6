use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

use super::classes::check_manage_role;

fn create_person(
    state: &AppState,
    req: &Request,
    table: &str,
    id_key: &str,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = check_manage_role(req) {
        return resp;
    }

    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    if first_name.is_empty() || last_name.is_empty() {
        return err(&req.id, "bad_params", "names must not be empty", None);
    }
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let phone = req
        .params
        .get("phone")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let id = Uuid::new_v4().to_string();
    let sql = format!(
        "INSERT INTO {}(id, first_name, last_name, email, phone) VALUES(?, ?, ?, ?, ?)",
        table
    );
    if let Err(e) = conn.execute(&sql, (&id, &first_name, &last_name, &email, &phone)) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": table })),
        );
    }

    ok(
        &req.id,
        json!({
            id_key: id,
            "firstName": first_name,
            "lastName": last_name
        }),
    )
}

fn list_people(state: &AppState, req: &Request, table: &str, list_key: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ list_key: [] }));
    };

    let sql = format!(
        "SELECT id, first_name, last_name, email, phone FROM {} ORDER BY last_name, first_name",
        table
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let first: String = row.get(1)?;
            let last: String = row.get(2)?;
            let email: Option<String> = row.get(3)?;
            let phone: Option<String> = row.get(4)?;
            Ok(json!({
                "id": id,
                "firstName": first,
                "lastName": last,
                "email": email,
                "phone": phone
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(people) => ok(&req.id, json!({ list_key: people })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.create" => Some(create_person(state, req, "teachers", "teacherId")),
        "teachers.list" => Some(list_people(state, req, "teachers", "teachers")),
        "parents.create" => Some(create_person(state, req, "parents", "parentId")),
        "parents.list" => Some(list_people(state, req, "parents", "parents")),
        _ => None,
    }
}
