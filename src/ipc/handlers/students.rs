use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::classes::check_manage_role;

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

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad(format!("{} must be YYYY-MM-DD", key)))
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn parent_exists(conn: &Connection, parent_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM parents WHERE id = ?", [parent_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_no = get_required_str(params, "studentNo")?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let date_of_birth = get_required_str(params, "dateOfBirth")?;
    let gender = get_required_str(params, "gender")?;
    let class_id = get_required_str(params, "classId")?;
    let year = params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad("missing year"))?;
    let email = get_optional_str(params, "email");
    let phone = get_optional_str(params, "phone");
    let parent_id = get_optional_str(params, "parentId");

    parse_date(&date_of_birth, "dateOfBirth")?;

    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE student_no = ?",
            [&student_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if duplicate.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: "student number already exists".to_string(),
            details: Some(json!({ "studentNo": student_no })),
        });
    }

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "class not found".to_string(),
            details: None,
        });
    }
    if let Some(pid) = parent_id.as_deref() {
        if !parent_exists(conn, pid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "parent not found".to_string(),
                details: None,
            });
        }
    }

    let student_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO students(id, student_no, class_id, first_name, last_name, year,
                              date_of_birth, gender, email, phone, parent_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &student_no,
            &class_id,
            &first_name,
            &last_name,
            year,
            &date_of_birth,
            &gender,
            &email,
            &phone,
            &parent_id,
            &created_at,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "studentNo": student_no,
        "classId": class_id
    }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let page = params.get("page").and_then(|v| v.as_i64()).unwrap_or(1).max(1);
    let limit = params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(10)
        .clamp(1, 100);
    let class_id = get_optional_str(params, "classId");
    let year = params.get("year").and_then(|v| v.as_i64());
    let search = get_optional_str(params, "search");

    let mut where_clauses: Vec<String> = Vec::new();
    let mut binds: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(cid) = class_id {
        where_clauses.push("s.class_id = ?".to_string());
        binds.push(rusqlite::types::Value::Text(cid));
    }
    if let Some(y) = year {
        where_clauses.push("s.year = ?".to_string());
        binds.push(rusqlite::types::Value::Integer(y));
    }
    if let Some(q) = search {
        where_clauses.push(
            "(s.student_no LIKE ? OR s.first_name LIKE ? OR s.last_name LIKE ? OR s.email LIKE ?)"
                .to_string(),
        );
        let pattern = format!("%{}%", q);
        for _ in 0..4 {
            binds.push(rusqlite::types::Value::Text(pattern.clone()));
        }
    }
    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM students s {}", where_sql);
    let total: i64 = conn
        .query_row(
            &count_sql,
            rusqlite::params_from_iter(binds.iter()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let list_sql = format!(
        "SELECT s.id, s.student_no, s.first_name, s.last_name, s.year, s.gender,
                s.date_of_birth, s.email, s.phone, c.id, c.name
         FROM students s
         JOIN classes c ON c.id = s.class_id
         {}
         ORDER BY s.created_at DESC
         LIMIT ? OFFSET ?",
        where_sql
    );
    binds.push(rusqlite::types::Value::Integer(limit));
    binds.push(rusqlite::types::Value::Integer((page - 1) * limit));

    let mut stmt = conn.prepare(&list_sql).map_err(HandlerErr::query)?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentNo": r.get::<_, String>(1)?,
                "firstName": r.get::<_, String>(2)?,
                "lastName": r.get::<_, String>(3)?,
                "year": r.get::<_, i64>(4)?,
                "gender": r.get::<_, String>(5)?,
                "dateOfBirth": r.get::<_, String>(6)?,
                "email": r.get::<_, Option<String>>(7)?,
                "phone": r.get::<_, Option<String>>(8)?,
                "class": {
                    "id": r.get::<_, String>(9)?,
                    "name": r.get::<_, String>(10)?
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Ok(json!({
        "students": students,
        "pagination": {
            "total": total,
            "page": page,
            "limit": limit,
            "pages": pages
        }
    }))
}

struct StudentRow {
    id: String,
    student_no: String,
    first_name: String,
    last_name: String,
    year: i64,
    gender: String,
    date_of_birth: String,
    email: Option<String>,
    phone: Option<String>,
    class_id: String,
    parent_id: Option<String>,
}

fn load_student_by_no(conn: &Connection, student_no: &str) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_no, first_name, last_name, year, gender, date_of_birth,
                email, phone, class_id, parent_id
         FROM students WHERE student_no = ?",
        [student_no],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                student_no: r.get(1)?,
                first_name: r.get(2)?,
                last_name: r.get(3)?,
                year: r.get(4)?,
                gender: r.get(5)?,
                date_of_birth: r.get(6)?,
                email: r.get(7)?,
                phone: r.get(8)?,
                class_id: r.get(9)?,
                parent_id: r.get(10)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

/// The admin "student lookup" view: profile, contacts, current-month
/// attendance, and current FIRST-term scores in one document.
fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_no = get_required_str(params, "studentNo")?;
    let Some(student) = load_student_by_no(conn, &student_no)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let (class_name, teacher): (String, Option<(String, String, Option<String>, Option<String>)>) =
        conn.query_row(
            "SELECT c.name, t.first_name, t.last_name, t.email, t.phone
             FROM classes c
             LEFT JOIN teachers t ON t.id = c.teacher_id
             WHERE c.id = ?",
            [&student.class_id],
            |r| {
                let name: String = r.get(0)?;
                let t_first: Option<String> = r.get(1)?;
                let t_last: Option<String> = r.get(2)?;
                let t_email: Option<String> = r.get(3)?;
                let t_phone: Option<String> = r.get(4)?;
                Ok((
                    name,
                    match (t_first, t_last) {
                        (Some(f), Some(l)) => Some((f, l, t_email, t_phone)),
                        _ => None,
                    },
                ))
            },
        )
        .map_err(HandlerErr::query)?;

    let parent_contact = match student.parent_id.as_deref() {
        Some(pid) => conn
            .query_row(
                "SELECT first_name, last_name, phone, email FROM parents WHERE id = ?",
                [pid],
                |r| {
                    let first: String = r.get(0)?;
                    let last: String = r.get(1)?;
                    let phone: Option<String> = r.get(2)?;
                    let email: Option<String> = r.get(3)?;
                    Ok(json!({
                        "name": format!("{} {}", first, last),
                        "phone": phone,
                        "email": email
                    }))
                },
            )
            .optional()
            .map_err(HandlerErr::query)?
            .unwrap_or(json!(null)),
        None => json!(null),
    };

    // Current calendar month, newest first, capped at 10 marks.
    let today = Utc::now().date_naive();
    let month_start = format!("{:04}-{:02}-01", today.year(), today.month());
    let mut att_stmt = conn
        .prepare(
            "SELECT date, status FROM attendance
             WHERE student_id = ? AND date >= ?
             ORDER BY date DESC
             LIMIT 10",
        )
        .map_err(HandlerErr::query)?;
    let marks: Vec<(String, String)> = att_stmt
        .query_map((&student.id, &month_start), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let total_days = marks.len() as i64;
    let present_days = marks.iter().filter(|(_, s)| s == "PRESENT").count() as i64;
    let attendance_percentage = if total_days > 0 {
        json!(format!(
            "{}%",
            calc::fixed1(present_days as f64 / total_days as f64 * 100.0)
        ))
    } else {
        json!("0%")
    };
    let recent: Vec<serde_json::Value> = marks
        .iter()
        .take(5)
        .map(|(date, status)| json!({ "date": date, "status": status }))
        .collect();

    // Current FIRST-term scores for the lookup card.
    let current_year = today.year() as i64;
    let mut score_stmt = conn
        .prepare(
            "SELECT sub.name, sub.code, sc.score, sc.max_score, sc.grade
             FROM scores sc
             JOIN subjects sub ON sub.id = sc.subject_id
             WHERE sc.student_id = ? AND sc.term = 'FIRST' AND sc.year = ?
             ORDER BY sub.name",
        )
        .map_err(HandlerErr::query)?;
    let score_rows: Vec<(String, String, f64, f64, String)> = score_stmt
        .query_map((&student.id, current_year), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    // Mean of raw scores here, unlike the pooled term average elsewhere.
    let average_score = if score_rows.is_empty() {
        json!(0)
    } else {
        let sum: f64 = score_rows.iter().map(|r| r.2).sum();
        json!(calc::fixed1(sum / score_rows.len() as f64))
    };
    let current_term_scores: Vec<serde_json::Value> = score_rows
        .iter()
        .map(|(name, code, score, max_score, grade)| {
            json!({
                "subject": name,
                "subjectCode": code,
                "score": score,
                "maxScore": max_score,
                "grade": grade
            })
        })
        .collect();

    Ok(json!({
        "studentInfo": {
            "studentNo": student.student_no,
            "fullName": format!("{} {}", student.first_name, student.last_name),
            "gender": student.gender,
            "dateOfBirth": student.date_of_birth,
            "class": class_name,
            "year": student.year
        },
        "contactInfo": {
            "email": student.email,
            "phone": student.phone,
            "parentContact": parent_contact
        },
        "attendanceSummary": {
            "totalDays": total_days,
            "presentDays": present_days,
            "absentDays": total_days - present_days,
            "attendancePercentage": attendance_percentage,
            "recentAttendance": recent
        },
        "academicRecords": {
            "currentTermScores": current_term_scores,
            "averageScore": average_score
        },
        "classInfo": {
            "className": class_name,
            "classTeacher": teacher.map(|(f, l, email, phone)| json!({
                "name": format!("{} {}", f, l),
                "email": email,
                "phone": phone
            })).unwrap_or(json!(null))
        }
    }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    if let Some(cid) = get_optional_str(params, "classId") {
        if !class_exists(conn, &cid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "class not found".to_string(),
                details: None,
            });
        }
    }
    if let Some(pid) = get_optional_str(params, "parentId") {
        if !parent_exists(conn, &pid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "parent not found".to_string(),
                details: None,
            });
        }
    }
    if let Some(dob) = get_optional_str(params, "dateOfBirth") {
        parse_date(&dob, "dateOfBirth")?;
    }

    let columns = [
        ("firstName", "first_name"),
        ("lastName", "last_name"),
        ("email", "email"),
        ("phone", "phone"),
        ("gender", "gender"),
        ("dateOfBirth", "date_of_birth"),
        ("classId", "class_id"),
        ("parentId", "parent_id"),
    ];
    for (key, column) in columns {
        if let Some(value) = get_optional_str(params, key) {
            let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
            conn.execute(&sql, (&value, &student_id))
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: Some(json!({ "column": column })),
                })?;
        }
    }
    if let Some(year) = params.get("year").and_then(|v| v.as_i64()) {
        conn.execute(
            "UPDATE students SET year = ? WHERE id = ?",
            (year, &student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "column": "year" })),
        })?;
    }

    Ok(json!({ "studentId": student_id }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    for (table, sql) in [
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        ("scores", "DELETE FROM scores WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_delete_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
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

fn with_conn_managed(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    if let Err(resp) = check_manage_role(req) {
        return resp;
    }
    with_conn(state, req, f)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(with_conn_managed(state, req, students_create)),
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.get" => Some(with_conn(state, req, students_get)),
        "students.update" => Some(with_conn_managed(state, req, students_update)),
        "students.delete" => Some(with_conn_managed(state, req, students_delete)),
        _ => None,
    }
}
