use crate::calc::{self, Grade, ScoreTotals, StudentStanding, Term};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

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

    fn not_found(message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code: "not_found",
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

fn parse_term(raw: &str) -> Result<Term, HandlerErr> {
    Term::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "term must be FIRST, SECOND, or THIRD".to_string(),
        details: Some(json!({ "term": raw })),
    })
}

fn get_year(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    params
        .get("year")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad("missing year"))
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

fn scores_enter(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let term = parse_term(&get_required_str(params, "term")?)?;
    let year = get_year(params)?;
    let score = params
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad("missing score"))?;
    let max_score = match params.get("maxScore") {
        None => 100.0,
        Some(v) if v.is_null() => 100.0,
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::bad("maxScore must be numeric"))?,
    };
    let comments = params
        .get("comments")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    if max_score <= 0.0 {
        return Err(HandlerErr::bad("maxScore must be greater than 0"));
    }
    if score < 0.0 || score > max_score {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("score must be between 0 and {}", max_score),
            details: Some(json!({ "score": score, "maxScore": max_score })),
        });
    }

    if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    if !row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)? {
        return Err(HandlerErr::not_found("subject not found"));
    }
    if !row_exists(conn, "SELECT 1 FROM teachers WHERE id = ?", &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    // The grade is always recomputed here, never accepted from the caller.
    let grade = Grade::from_score(score, max_score);

    conn.execute(
        "INSERT INTO scores(student_id, subject_id, term, year, score, max_score,
                            grade, teacher_id, comments)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, term, year) DO UPDATE SET
           score = excluded.score,
           max_score = excluded.max_score,
           grade = excluded.grade,
           teacher_id = excluded.teacher_id,
           comments = excluded.comments",
        (
            &student_id,
            &subject_id,
            term.as_str(),
            year,
            score,
            max_score,
            grade.as_str(),
            &teacher_id,
            &comments,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "scores" })),
    })?;

    Ok(json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "term": term.as_str(),
        "year": year,
        "score": score,
        "maxScore": max_score,
        "grade": grade.as_str()
    }))
}

struct ScoreRow {
    subject_name: String,
    subject_code: String,
    score: f64,
    max_score: f64,
    grade: String,
    teacher_name: String,
    comments: Option<String>,
}

fn student_score_rows(
    conn: &Connection,
    student_id: &str,
    term: Term,
    year: i64,
) -> Result<Vec<ScoreRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT sub.name, sub.code, sc.score, sc.max_score, sc.grade,
                    t.first_name, t.last_name, sc.comments
             FROM scores sc
             JOIN subjects sub ON sub.id = sc.subject_id
             JOIN teachers t ON t.id = sc.teacher_id
             WHERE sc.student_id = ? AND sc.term = ? AND sc.year = ?
             ORDER BY sub.name",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map((student_id, term.as_str(), year), |r| {
        let t_first: String = r.get(5)?;
        let t_last: String = r.get(6)?;
        Ok(ScoreRow {
            subject_name: r.get(0)?,
            subject_code: r.get(1)?,
            score: r.get(2)?,
            max_score: r.get(3)?,
            grade: r.get(4)?,
            teacher_name: format!("{} {}", t_first, t_last),
            comments: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn scores_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let term = parse_term(&get_required_str(params, "term")?)?;
    let year = get_year(params)?;

    if !row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let rows = student_score_rows(conn, &student_id, term, year)?;
    let mut totals = ScoreTotals::default();
    for row in &rows {
        totals.add(row.score, row.max_score);
    }

    // Summary grade comes from the one-decimal display value, so it always
    // agrees with the average the caller sees.
    let average_display = calc::fixed1(totals.average());
    let overall_grade =
        Grade::from_percentage(average_display.parse::<f64>().unwrap_or(0.0));

    Ok(json!({
        "studentId": student_id,
        "term": term.as_str(),
        "year": year,
        "scores": rows
            .iter()
            .map(|row| json!({
                "subject": row.subject_name,
                "subjectCode": row.subject_code,
                "score": row.score,
                "maxScore": row.max_score,
                "grade": row.grade,
                "teacher": row.teacher_name,
                "comments": row.comments
            }))
            .collect::<Vec<_>>(),
        "summary": {
            "totalSubjects": totals.subject_count,
            "totalScore": totals.total_score,
            "totalMaxScore": totals.total_max_score,
            "average": format!("{}%", average_display),
            "overallGrade": overall_grade.as_str()
        }
    }))
}

fn scores_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let term = parse_term(&get_required_str(params, "term")?)?;
    let year = get_year(params)?;

    if !row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    // Enrolment order; equal averages keep this order in the ranking.
    let mut students_stmt = conn
        .prepare(
            "SELECT id, first_name, last_name, student_no
             FROM students
             WHERE class_id = ?
             ORDER BY rowid",
        )
        .map_err(HandlerErr::query)?;
    let students: Vec<(String, String, String, String)> = students_stmt
        .query_map([&class_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut scores_stmt = conn
        .prepare(
            "SELECT sc.student_id, sub.name, sub.code, sc.score, sc.max_score, sc.grade
             FROM scores sc
             JOIN subjects sub ON sub.id = sc.subject_id
             JOIN students s ON s.id = sc.student_id
             WHERE s.class_id = ? AND sc.term = ? AND sc.year = ?
             ORDER BY sub.name",
        )
        .map_err(HandlerErr::query)?;
    let score_rows: Vec<(String, String, String, f64, f64, String)> = scores_stmt
        .query_map((&class_id, term.as_str(), year), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut by_student: HashMap<String, Vec<&(String, String, String, f64, f64, String)>> =
        HashMap::new();
    for row in &score_rows {
        by_student.entry(row.0.clone()).or_default().push(row);
    }

    let mut standings: Vec<StudentStanding> = Vec::with_capacity(students.len());
    let mut details: HashMap<String, serde_json::Value> = HashMap::new();
    for (id, first, last, student_no) in &students {
        let rows = by_student.get(id).map(|v| v.as_slice()).unwrap_or(&[]);
        let mut totals = ScoreTotals::default();
        for row in rows {
            totals.add(row.3, row.4);
        }
        let average = totals.average();
        // Rank on the one-decimal value the API reports.
        let rounded: f64 = calc::fixed1(average).parse().unwrap_or(0.0);
        standings.push(StudentStanding {
            student_id: id.clone(),
            average: rounded,
            overall_grade: Grade::from_percentage(average),
        });
        details.insert(
            id.clone(),
            json!({
                "studentId": id,
                "studentName": format!("{} {}", first, last),
                "studentNo": student_no,
                "totalScore": totals.total_score,
                "totalMaxScore": totals.total_max_score,
                "subjectCount": totals.subject_count,
                "scores": rows
                    .iter()
                    .map(|row| json!({
                        "subject": row.1,
                        "subjectCode": row.2,
                        "score": row.3,
                        "maxScore": row.4,
                        "grade": row.5
                    }))
                    .collect::<Vec<_>>()
            }),
        );
    }

    let standings = calc::rank_standings(standings);
    let student_results: Vec<serde_json::Value> = standings
        .ranked
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let mut row = details
                .remove(&s.student_id)
                .unwrap_or_else(|| json!({ "studentId": s.student_id }));
            if let Some(obj) = row.as_object_mut() {
                obj.insert("average".to_string(), json!(s.average));
                obj.insert(
                    "overallGrade".to_string(),
                    json!(s.overall_grade.as_str()),
                );
                obj.insert("position".to_string(), json!(i + 1));
            }
            row
        })
        .collect();

    Ok(json!({
        "classId": class_id,
        "term": term.as_str(),
        "year": year,
        "totalStudents": standings.ranked.len(),
        "classStatistics": {
            "classAverage": format!("{}%", calc::fixed1(standings.class_average)),
            "gradeDistribution": standings.grade_distribution,
            "highestScore": standings.highest_score,
            "lowestScore": standings.lowest_score
        },
        "studentResults": student_results
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

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.enter" => {
            if let Err(resp) = check_marking_role(req) {
                return Some(resp);
            }
            Some(with_conn(state, req, scores_enter))
        }
        "scores.student" => Some(with_conn(state, req, scores_student)),
        "scores.class" => Some(with_conn(state, req, scores_class)),
        _ => None,
    }
}
