use crate::calc::Term;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::report;
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn parse_term(req: &Request) -> Result<Term, serde_json::Value> {
    let raw = required_str(req, "term")?;
    Term::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "term must be FIRST, SECOND, or THIRD",
            Some(json!({ "term": raw })),
        )
    })
}

fn parse_year(req: &Request) -> Result<i64, serde_json::Value> {
    req.params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", "missing year", None))
}

fn report_err(req: &Request, e: report::ReportError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, None)
}

fn handle_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match parse_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match parse_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match report::compose_report_card(conn, &student_id, term, year) {
        Ok(card) => ok(&req.id, json!({ "reportCard": card })),
        Err(e) => report_err(req, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCard" => Some(handle_report_card(state, req)),
        _ => None,
    }
}
