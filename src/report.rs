use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

use crate::calc::{
    self, AttendanceStatus, Grade, ScoreTotals, StudentStanding, Term,
};

#[derive(Debug, Clone)]
pub struct ReportError {
    pub code: String,
    pub message: String,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn db_err(e: rusqlite::Error) -> ReportError {
    ReportError::new("db_query_failed", e.to_string())
}

struct StudentIdentity {
    first_name: String,
    last_name: String,
    student_no: String,
    class_id: String,
    class_name: String,
    year: i64,
    date_of_birth: String,
    gender: String,
    teacher_name: Option<String>,
    parent: Option<(String, Option<String>, Option<String>)>,
}

fn load_identity(conn: &Connection, student_id: &str) -> Result<Option<StudentIdentity>, ReportError> {
    conn.query_row(
        "SELECT s.first_name, s.last_name, s.student_no, s.class_id, c.name,
                s.year, s.date_of_birth, s.gender,
                t.first_name, t.last_name,
                p.first_name, p.last_name, p.phone, p.email
         FROM students s
         JOIN classes c ON c.id = s.class_id
         LEFT JOIN teachers t ON t.id = c.teacher_id
         LEFT JOIN parents p ON p.id = s.parent_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let t_first: Option<String> = r.get(8)?;
            let t_last: Option<String> = r.get(9)?;
            let p_first: Option<String> = r.get(10)?;
            let p_last: Option<String> = r.get(11)?;
            let p_phone: Option<String> = r.get(12)?;
            let p_email: Option<String> = r.get(13)?;
            Ok(StudentIdentity {
                first_name: r.get(0)?,
                last_name: r.get(1)?,
                student_no: r.get(2)?,
                class_id: r.get(3)?,
                class_name: r.get(4)?,
                year: r.get(5)?,
                date_of_birth: r.get(6)?,
                gender: r.get(7)?,
                teacher_name: match (t_first, t_last) {
                    (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
                    _ => None,
                },
                parent: match (p_first, p_last) {
                    (Some(f), Some(l)) => Some((format!("{} {}", f, l), p_phone, p_email)),
                    _ => None,
                },
            })
        },
    )
    .optional()
    .map_err(db_err)
}

struct SubjectScore {
    subject_name: String,
    subject_code: String,
    score: f64,
    max_score: f64,
    grade: String,
    teacher_name: String,
    comments: Option<String>,
}

fn load_subject_scores(
    conn: &Connection,
    student_id: &str,
    term: Term,
    year: i64,
) -> Result<Vec<SubjectScore>, ReportError> {
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
        .map_err(db_err)?;
    stmt.query_map((student_id, term.as_str(), year), |r| {
        let t_first: String = r.get(5)?;
        let t_last: String = r.get(6)?;
        Ok(SubjectScore {
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
    .map_err(db_err)
}

/// Ranks every student in the class on pooled (term, year) averages so the
/// report can carry the subject student's position.
fn class_standings(
    conn: &Connection,
    class_id: &str,
    term: Term,
    year: i64,
) -> Result<calc::ClassStandings, ReportError> {
    let mut students_stmt = conn
        .prepare("SELECT id FROM students WHERE class_id = ? ORDER BY rowid")
        .map_err(db_err)?;
    let student_ids: Vec<String> = students_stmt
        .query_map([class_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut scores_stmt = conn
        .prepare(
            "SELECT sc.student_id, sc.score, sc.max_score
             FROM scores sc
             JOIN students s ON s.id = sc.student_id
             WHERE s.class_id = ? AND sc.term = ? AND sc.year = ?",
        )
        .map_err(db_err)?;
    let rows: Vec<(String, f64, f64)> = scores_stmt
        .query_map((class_id, term.as_str(), year), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut totals: HashMap<String, ScoreTotals> = HashMap::new();
    for (sid, score, max_score) in rows {
        totals.entry(sid).or_default().add(score, max_score);
    }

    let standings = student_ids
        .into_iter()
        .map(|sid| {
            let t = totals.get(&sid).copied().unwrap_or_default();
            StudentStanding {
                student_id: sid,
                average: t.average(),
                overall_grade: t.overall_grade(),
            }
        })
        .collect();
    Ok(calc::rank_standings(standings))
}

/// Builds the composite report card document for one (student, term, year).
///
/// The attendance window is the last 30 recorded marks by date, not the
/// term's calendar span.
pub fn compose_report_card(
    conn: &Connection,
    student_id: &str,
    term: Term,
    year: i64,
) -> Result<serde_json::Value, ReportError> {
    let Some(identity) = load_identity(conn, student_id)? else {
        return Err(ReportError::new("not_found", "student not found"));
    };

    let subjects = load_subject_scores(conn, student_id, term, year)?;
    let mut totals = ScoreTotals::default();
    for s in &subjects {
        totals.add(s.score, s.max_score);
    }
    let average = totals.average();
    let overall_grade = Grade::from_percentage(average);

    let standings = class_standings(conn, &identity.class_id, term, year)?;
    let position = standings.position_of(student_id).unwrap_or(0);
    let total_students_in_class = standings.ranked.len();

    let mut att_stmt = conn
        .prepare(
            "SELECT status FROM attendance
             WHERE student_id = ?
             ORDER BY date DESC
             LIMIT 30",
        )
        .map_err(db_err)?;
    let statuses: Vec<String> = att_stmt
        .query_map([student_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    let tally = calc::tally_statuses(
        statuses
            .iter()
            .filter_map(|s| AttendanceStatus::parse(s)),
    );
    let attendance_pct = tally.percentage();
    let attendance_pct_field = if tally.total_days > 0 {
        json!(calc::fixed1(attendance_pct))
    } else {
        json!(0)
    };
    // Remarks band on the one-decimal value the document shows.
    let attendance_pct_rounded: f64 = calc::fixed1(attendance_pct).parse().unwrap_or(0.0);

    let subjects_json: Vec<serde_json::Value> = subjects
        .iter()
        .map(|s| {
            json!({
                "subject": s.subject_name,
                "subjectCode": s.subject_code,
                "score": s.score,
                "maxScore": s.max_score,
                "percentage": calc::fixed1(s.score / s.max_score * 100.0),
                "grade": s.grade,
                "teacher": s.teacher_name,
                "comments": s.comments
            })
        })
        .collect();

    Ok(json!({
        "studentInfo": {
            "name": format!("{} {}", identity.first_name, identity.last_name),
            "studentNo": identity.student_no,
            "class": identity.class_name,
            "year": identity.year,
            "dateOfBirth": identity.date_of_birth,
            "gender": identity.gender
        },
        "termInfo": {
            "term": term.as_str(),
            "year": year,
            "generatedDate": Utc::now().to_rfc3339()
        },
        "classInfo": {
            "className": identity.class_name,
            "classTeacher": identity
                .teacher_name
                .clone()
                .unwrap_or_else(|| "Not assigned".to_string())
        },
        "parentInfo": identity.parent.as_ref().map(|(name, phone, email)| json!({
            "name": name,
            "phone": phone,
            "email": email
        })).unwrap_or(json!(null)),
        "academicPerformance": {
            "subjects": subjects_json,
            "summary": {
                "totalSubjects": totals.subject_count,
                "totalScore": totals.total_score,
                "totalMaxScore": totals.total_max_score,
                "overallAverage": calc::fixed1(average),
                "overallGrade": overall_grade.as_str(),
                "classPosition": position,
                "totalStudentsInClass": total_students_in_class,
                "positionSuffix": calc::position_suffix(position)
            }
        },
        "attendanceSummary": {
            "totalDays": tally.total_days,
            "presentDays": tally.present_days,
            "absentDays": tally.absent_days,
            "lateDays": tally.late_days,
            "attendancePercentage": attendance_pct_field
        },
        "remarks": {
            "academicRemarks": calc::academic_remarks(average),
            "attendanceRemarks": calc::attendance_remarks(attendance_pct_rounded),
            "generalRemarks": calc::general_remarks(average, attendance_pct_rounded)
        }
    }))
}
