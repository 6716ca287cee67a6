use crate::calc::{self, AttendanceStatus, AttendanceTally};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::classes::check_marking_role;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn query(e: rusqlite::Error) -> HandlerErr {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    fn bad(message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad(format!("missing {}", key)))
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "status must be PRESENT, ABSENT, or LATE".to_string(),
        details: Some(json!({ "status": raw })),
    })
}

fn parse_date(raw: &str, key: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| HandlerErr::bad(format!("{} must be YYYY-MM-DD", key)))
}

/// Returns the student's class id, or not_found.
fn student_class(conn: &Connection, student_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "student not found".to_string(),
        details: Some(json!({ "studentId": student_id })),
    })
}

fn require_membership(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
) -> Result<(), HandlerErr> {
    let actual = student_class(conn, student_id)?;
    if actual != class_id {
        return Err(HandlerErr {
            code: "conflict",
            message: "student does not belong to this class".to_string(),
            details: Some(json!({ "studentId": student_id, "classId": class_id })),
        });
    }
    Ok(())
}

fn upsert_mark(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    date: &str,
    status: AttendanceStatus,
) -> Result<(), HandlerErr> {
    // Atomic insert-or-update on the natural key; re-marking a day
    // overwrites the status in place and keeps no history.
    conn.execute(
        "INSERT INTO attendance(student_id, date, class_id, status, created_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date) DO UPDATE SET
           status = excluded.status,
           class_id = excluded.class_id",
        (
            student_id,
            date,
            class_id,
            status.as_str(),
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;
    Ok(())
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?, "date")?;
    let status = parse_status(&get_required_str(params, "status")?)?;

    require_membership(conn, &student_id, &class_id)?;
    upsert_mark(conn, &student_id, &class_id, &date, status)?;

    Ok(json!({
        "studentId": student_id,
        "classId": class_id,
        "date": date,
        "status": status.as_str()
    }))
}

fn attendance_mark_bulk(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?, "date")?;
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad("missing records"));
    };

    // Validate every row before any write so a bad record rejects the
    // whole batch with nothing applied.
    let mut parsed: Vec<(String, AttendanceStatus)> = Vec::with_capacity(records.len());
    for record in records {
        let student_id = get_required_str(record, "studentId")?;
        let status = parse_status(&get_required_str(record, "status")?)?;
        require_membership(conn, &student_id, &class_id)?;
        parsed.push((student_id, status));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for (student_id, status) in &parsed {
        upsert_mark(&tx, student_id, &class_id, &date, *status)?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "classId": class_id, "date": date, "marked": parsed.len() }))
}

/// Daily roll-call view: every student in the class with their mark for one
/// date, or null when nothing is recorded yet.
fn attendance_class_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?, "date")?;

    let class_found: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if class_found.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.first_name, s.last_name, s.student_no, a.status
             FROM students s
             LEFT JOIN attendance a ON a.student_id = s.id AND a.date = ?
             WHERE s.class_id = ?
             ORDER BY s.first_name",
        )
        .map_err(HandlerErr::query)?;
    let rows: Vec<serde_json::Value> = stmt
        .query_map((&date, &class_id), |r| {
            let id: String = r.get(0)?;
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            let student_no: String = r.get(3)?;
            let status: Option<String> = r.get(4)?;
            let marked = status.is_some();
            Ok(json!({
                "studentId": id,
                "studentName": format!("{} {}", first, last),
                "studentNo": student_no,
                "status": status,
                "marked": marked
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let marked = rows
        .iter()
        .filter(|r| r.get("marked").and_then(|v| v.as_bool()).unwrap_or(false))
        .count();

    Ok(json!({
        "classId": class_id,
        "date": date,
        "totalStudents": rows.len(),
        "markedAttendance": marked,
        "attendanceData": rows
    }))
}

fn optional_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(raw) if !raw.trim().is_empty() => Ok(Some(parse_date(raw, key)?)),
        _ => Ok(None),
    }
}

fn tally_to_json(tally: &AttendanceTally) -> serde_json::Value {
    json!({
        "totalDays": tally.total_days,
        "presentDays": tally.present_days,
        "absentDays": tally.absent_days,
        "lateDays": tally.late_days,
        "attendancePercentage": tally.percentage_display()
    })
}

fn attendance_student_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let start_date = optional_date(params, "startDate")?;
    let end_date = optional_date(params, "endDate")?;

    let student: Option<(String, String, String)> = conn
        .query_row(
            "SELECT first_name, last_name, student_no FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((first, last, student_no)) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let mut sql = String::from(
        "SELECT date, status, created_at FROM attendance WHERE student_id = ?",
    );
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(student_id.clone())];
    if let Some(start) = &start_date {
        sql.push_str(" AND date >= ?");
        binds.push(rusqlite::types::Value::Text(start.clone()));
    }
    if let Some(end) = &end_date {
        sql.push_str(" AND date <= ?");
        binds.push(rusqlite::types::Value::Text(end.clone()));
    }
    sql.push_str(" ORDER BY date DESC");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let records: Vec<(String, String, String)> = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let tally = calc::tally_statuses(
        records
            .iter()
            .filter_map(|(_, status, _)| AttendanceStatus::parse(status)),
    );

    Ok(json!({
        "studentInfo": {
            "name": format!("{} {}", first, last),
            "studentNo": student_no
        },
        "summary": tally_to_json(&tally),
        "attendanceRecords": records
            .iter()
            .map(|(date, status, created_at)| json!({
                "date": date,
                "status": status,
                "createdAt": created_at
            }))
            .collect::<Vec<_>>()
    }))
}

fn attendance_class_report(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let start_date = optional_date(params, "startDate")?;
    let end_date = optional_date(params, "endDate")?;

    let class_row: Option<(String, i64, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT c.name, c.year, t.first_name, t.last_name
             FROM classes c
             LEFT JOIN teachers t ON t.id = c.teacher_id
             WHERE c.id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((class_name, class_year, t_first, t_last)) = class_row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    };
    let teacher_name = match (t_first, t_last) {
        (Some(f), Some(l)) => format!("{} {}", f, l),
        _ => "No teacher assigned".to_string(),
    };

    let mut sql = String::from(
        "SELECT s.id, s.first_name, s.last_name, s.student_no, a.status
         FROM students s
         LEFT JOIN attendance a ON a.student_id = s.id",
    );
    if start_date.is_some() {
        sql.push_str(" AND a.date >= ?");
    }
    if end_date.is_some() {
        sql.push_str(" AND a.date <= ?");
    }
    sql.push_str(" WHERE s.class_id = ? ORDER BY s.first_name");

    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(start) = &start_date {
        binds.push(rusqlite::types::Value::Text(start.clone()));
    }
    if let Some(end) = &end_date {
        binds.push(rusqlite::types::Value::Text(end.clone()));
    }
    binds.push(rusqlite::types::Value::Text(class_id.clone()));

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows: Vec<(String, String, String, String, Option<String>)> = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    // Left-join order is stable per student, so fold rows into per-student
    // tallies preserving the first-name ordering.
    let mut order: Vec<String> = Vec::new();
    let mut info: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();
    let mut tallies: std::collections::HashMap<String, AttendanceTally> =
        std::collections::HashMap::new();
    for (id, first, last, student_no, status) in rows {
        if !info.contains_key(&id) {
            order.push(id.clone());
            info.insert(
                id.clone(),
                (format!("{} {}", first, last), student_no),
            );
            tallies.insert(id.clone(), AttendanceTally::default());
        }
        if let Some(status) = status.as_deref().and_then(AttendanceStatus::parse) {
            if let Some(tally) = tallies.get_mut(&id) {
                tally.add(status);
            }
        }
    }

    let mut class_tally = AttendanceTally::default();
    let student_reports: Vec<serde_json::Value> = order
        .iter()
        .map(|id| {
            let (name, student_no) = info.get(id).cloned().unwrap_or_default();
            let tally = tallies.get(id).copied().unwrap_or_default();
            class_tally.merge(tally);
            let mut row = tally_to_json(&tally);
            if let Some(obj) = row.as_object_mut() {
                obj.insert("studentId".to_string(), json!(id));
                obj.insert("studentName".to_string(), json!(name));
                obj.insert("studentNo".to_string(), json!(student_no));
            }
            row
        })
        .collect();

    Ok(json!({
        "classInfo": {
            "name": class_name,
            "year": class_year,
            "teacher": teacher_name
        },
        "reportPeriod": {
            "startDate": start_date.unwrap_or_else(|| "All time".to_string()),
            "endDate": end_date.unwrap_or_else(|| "All time".to_string())
        },
        "classSummary": {
            "totalStudents": order.len(),
            "totalPossibleAttendance": class_tally.total_days,
            "totalPresent": class_tally.present_days,
            "totalAbsent": class_tally.absent_days,
            "totalLate": class_tally.late_days,
            "classAttendancePercentage": class_tally.percentage_display()
        },
        "studentReports": student_reports
    }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn with_conn_marking(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    if let Err(resp) = check_marking_role(req) {
        return resp;
    }
    with_conn(state, req, f)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(with_conn_marking(state, req, attendance_mark)),
        "attendance.markBulk" => Some(with_conn_marking(state, req, attendance_mark_bulk)),
        "attendance.classDay" => Some(with_conn(state, req, attendance_class_day)),
        "attendance.studentSummary" => Some(with_conn(state, req, attendance_student_summary)),
        "attendance.classReport" => Some(with_conn(state, req, attendance_class_report)),
        _ => None,
    }
}
