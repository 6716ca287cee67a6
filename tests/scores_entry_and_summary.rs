use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> std::path::PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

struct Seed {
    teacher_id: String,
    student_id: String,
    math_id: String,
    english_id: String,
}

fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> Seed {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s2",
        "teachers.create",
        json!({ "firstName": "Ngozi", "lastName": "Balogun" }),
    );
    let teacher_id = teacher
        .get("teacherId")
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let class = request_ok(
        stdin,
        reader,
        "s3",
        "classes.create",
        json!({ "name": "Grade 6A", "year": 2025, "teacherId": teacher_id }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let student = request_ok(
        stdin,
        reader,
        "s4",
        "students.create",
        json!({
            "studentNo": "STU-401",
            "firstName": "Femi",
            "lastName": "Adewale",
            "dateOfBirth": "2013-09-01",
            "gender": "MALE",
            "classId": class_id,
            "year": 2025
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let math = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({ "name": "Mathematics", "code": "MATH" }),
    );
    let english = request_ok(
        stdin,
        reader,
        "s6",
        "subjects.create",
        json!({ "name": "English", "code": "ENG" }),
    );
    Seed {
        teacher_id,
        student_id,
        math_id: math
            .get("subjectId")
            .and_then(|v| v.as_str())
            .expect("subjectId")
            .to_string(),
        english_id: english
            .get("subjectId")
            .and_then(|v| v.as_str())
            .expect("subjectId")
            .to_string(),
    }
}

#[test]
fn entering_a_score_derives_the_grade() {
    let workspace = temp_dir("schoold-scores-grade");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    let entered = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.enter",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.math_id,
            "teacherId": seed.teacher_id,
            "term": "FIRST",
            "year": 2025,
            "score": 72.0
        }),
    );
    // maxScore defaults to 100, grade is derived from the percentage.
    assert_eq!(entered.get("maxScore").and_then(|v| v.as_f64()), Some(100.0));
    assert_eq!(entered.get("grade").and_then(|v| v.as_str()), Some("C"));

    // Out-of-100 scale: 45/50 is 90%, an A.
    let scaled = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.enter",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.english_id,
            "teacherId": seed.teacher_id,
            "term": "FIRST",
            "year": 2025,
            "score": 45.0,
            "maxScore": 50.0
        }),
    );
    assert_eq!(scaled.get("grade").and_then(|v| v.as_str()), Some("A"));
}

#[test]
fn reentering_overwrites_the_existing_row() {
    let workspace = temp_dir("schoold-scores-upsert");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    for (i, score) in [55.0, 88.0].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "scores.enter",
            json!({
                "studentId": seed.student_id,
                "subjectId": seed.math_id,
                "teacherId": seed.teacher_id,
                "term": "FIRST",
                "year": 2025,
                "score": score
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "q1",
        "scores.student",
        json!({ "studentId": seed.student_id, "term": "FIRST", "year": 2025 }),
    );
    let scores = summary
        .get("scores")
        .and_then(|v| v.as_array())
        .expect("scores");
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].get("score").and_then(|v| v.as_f64()), Some(88.0));
    assert_eq!(scores[0].get("grade").and_then(|v| v.as_str()), Some("B"));
}

#[test]
fn student_summary_pools_scores_across_subjects() {
    let workspace = temp_dir("schoold-scores-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    // Math 80/100 and English 45/50 pool to 125/150, 83.3%.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "scores.enter",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.math_id,
            "teacherId": seed.teacher_id,
            "term": "FIRST",
            "year": 2025,
            "score": 80.0
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "e2",
        "scores.enter",
        json!({
            "studentId": seed.student_id,
            "subjectId": seed.english_id,
            "teacherId": seed.teacher_id,
            "term": "FIRST",
            "year": 2025,
            "score": 45.0,
            "maxScore": 50.0
        }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "q1",
        "scores.student",
        json!({ "studentId": seed.student_id, "term": "FIRST", "year": 2025 }),
    );
    let summary = result.get("summary").expect("summary");
    assert_eq!(
        summary.get("totalSubjects").and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(
        summary.get("totalScore").and_then(|v| v.as_f64()),
        Some(125.0)
    );
    assert_eq!(
        summary.get("totalMaxScore").and_then(|v| v.as_f64()),
        Some(150.0)
    );
    assert_eq!(
        summary.get("average").and_then(|v| v.as_str()),
        Some("83.3%")
    );
    assert_eq!(
        summary.get("overallGrade").and_then(|v| v.as_str()),
        Some("B")
    );

    // Subjects come back alphabetically.
    let rows = result
        .get("scores")
        .and_then(|v| v.as_array())
        .expect("scores");
    assert_eq!(
        rows[0].get("subject").and_then(|v| v.as_str()),
        Some("English")
    );
    assert_eq!(
        rows[1].get("subject").and_then(|v| v.as_str()),
        Some("Mathematics")
    );
}

#[test]
fn entry_rejects_bad_input_and_unknown_referents() {
    let workspace = temp_dir("schoold-scores-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    let base = json!({
        "studentId": seed.student_id,
        "subjectId": seed.math_id,
        "teacherId": seed.teacher_id,
        "term": "FIRST",
        "year": 2025
    });

    let mut over = base.clone();
    over["score"] = json!(120.0);
    let error = request_err(&mut stdin, &mut reader, "1", "scores.enter", over);
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let mut negative = base.clone();
    negative["score"] = json!(-5.0);
    let error = request_err(&mut stdin, &mut reader, "2", "scores.enter", negative);
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let mut zero_max = base.clone();
    zero_max["score"] = json!(0.0);
    zero_max["maxScore"] = json!(0.0);
    let error = request_err(&mut stdin, &mut reader, "3", "scores.enter", zero_max);
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let mut bad_term = base.clone();
    bad_term["score"] = json!(50.0);
    bad_term["term"] = json!("FOURTH");
    let error = request_err(&mut stdin, &mut reader, "4", "scores.enter", bad_term);
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let mut ghost_teacher = base.clone();
    ghost_teacher["score"] = json!(50.0);
    ghost_teacher["teacherId"] = json!("no-such-teacher");
    let error = request_err(&mut stdin, &mut reader, "5", "scores.enter", ghost_teacher);
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some("not_found")
    );
}

#[test]
fn parent_role_cannot_enter_scores() {
    let workspace = temp_dir("schoold-scores-role");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed(&mut stdin, &mut reader, &workspace);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "scores.enter",
        json!({
            "actorRole": "PARENT",
            "studentId": seed.student_id,
            "subjectId": seed.math_id,
            "teacherId": seed.teacher_id,
            "term": "FIRST",
            "year": 2025,
            "score": 50.0
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("conflict"));
}
