use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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
    let exe = env!("CARGO_BIN_EXE_edusmartd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn edusmartd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
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
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().expect("result present")
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    code: &str,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    let error = value.get("error").cloned().expect("error present");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some(code),
        "wrong error code for {}: {}",
        method,
        error
    );
    error
}

fn register_institution(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "institutions.register",
        json!({ "name": name }),
    );
    res["institutionId"].as_str().expect("institutionId").to_string()
}

fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    institution_id: &str,
    name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "classes.create",
        json!({ "institutionId": institution_id, "name": name }),
    );
    res["classGroupId"].as_str().expect("classGroupId").to_string()
}

#[test]
fn enrollment_starts_unassigned_and_reassignment_moves_the_student() {
    let workspace = temp_dir("edusmart-members-reassign");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let institution_id = register_institution(&mut stdin, &mut reader, "2", "Membership School");
    let class_group_id = create_class(&mut stdin, &mut reader, "3", &institution_id, "5e B");

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.enroll",
        json!({
            "institutionId": institution_id,
            "lastName": "Kone",
            "firstName": "Issa"
        }),
    );
    let student_id = enrolled["studentId"].as_str().expect("studentId").to_string();

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.list",
        json!({ "institutionId": institution_id }),
    );
    let row = &listed["students"][0];
    assert_eq!(row["id"].as_str(), Some(student_id.as_str()));
    assert!(row["classGroupId"].is_null());

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": student_id, "patch": { "classGroupId": class_group_id } }),
    );
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "institutionId": institution_id, "classGroupId": class_group_id }),
    );
    let members = roster["students"].as_array().expect("students");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0]["id"].as_str(), Some(student_id.as_str()));

    // Unassigning puts the student back into the institution-wide pool.
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": student_id, "patch": { "classGroupId": null } }),
    );
    let emptied = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.list",
        json!({ "institutionId": institution_id, "classGroupId": class_group_id }),
    );
    assert_eq!(emptied["students"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn class_group_must_belong_to_the_same_institution() {
    let workspace = temp_dir("edusmart-members-crossinst");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let inst_a = register_institution(&mut stdin, &mut reader, "2", "Institution A");
    let inst_b = register_institution(&mut stdin, &mut reader, "3", "Institution B");
    let class_b = create_class(&mut stdin, &mut reader, "4", &inst_b, "Terminale");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "students.enroll",
        json!({
            "institutionId": inst_a,
            "classGroupId": class_b,
            "lastName": "Cisse",
            "firstName": "Mariam"
        }),
        "bad_params",
    );
    assert_eq!(
        error["message"].as_str(),
        Some("class group belongs to another institution")
    );

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.enroll",
        json!({ "institutionId": inst_a, "lastName": "Cisse", "firstName": "Mariam" }),
    );
    let student_id = enrolled["studentId"].as_str().expect("studentId").to_string();

    request_err(
        &mut stdin,
        &mut reader,
        "7",
        "students.update",
        json!({ "studentId": student_id, "patch": { "classGroupId": class_b } }),
        "bad_params",
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scores_require_matching_class_membership() {
    let workspace = temp_dir("edusmart-members-scores");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let institution_id = register_institution(&mut stdin, &mut reader, "2", "Score School");
    let class_a = create_class(&mut stdin, &mut reader, "3", &institution_id, "5e A");
    let class_b = create_class(&mut stdin, &mut reader, "4", &institution_id, "5e B");

    let subject_b = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "classGroupId": class_b, "name": "Mathematics" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.enroll",
        json!({
            "institutionId": institution_id,
            "classGroupId": class_a,
            "lastName": "Dembele",
            "firstName": "Oumar"
        }),
    );
    let student_id = enrolled["studentId"].as_str().expect("studentId").to_string();

    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "scores.record",
        json!({
            "studentId": student_id,
            "subjectId": subject_b,
            "session": 1,
            "kind": "exam",
            "ordinal": 1,
            "value": 50.0
        }),
        "bad_params",
    );
    assert_eq!(
        error["message"].as_str(),
        Some("student is not enrolled in the subject's class group")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_class_unassigns_its_students() {
    let workspace = temp_dir("edusmart-members-classdelete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let institution_id = register_institution(&mut stdin, &mut reader, "2", "Survivor School");
    let class_group_id = create_class(&mut stdin, &mut reader, "3", &institution_id, "CM2");

    let subject_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "subjects.create",
        json!({ "classGroupId": class_group_id, "name": "French" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();
    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.enroll",
        json!({
            "institutionId": institution_id,
            "classGroupId": class_group_id,
            "lastName": "Sidibe",
            "firstName": "Nana"
        }),
    );
    let student_id = enrolled["studentId"].as_str().expect("studentId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "scores.record",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "session": 1,
            "kind": "continuous",
            "ordinal": 1,
            "value": 70.0
        }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "classes.delete",
        json!({ "classGroupId": class_group_id }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.list",
        json!({ "institutionId": institution_id }),
    );
    let row = &listed["students"][0];
    assert_eq!(row["id"].as_str(), Some(student_id.as_str()));
    assert!(row["classGroupId"].is_null());

    // The class and its subjects are gone with their score history.
    request_err(
        &mut stdin,
        &mut reader,
        "9",
        "reports.classList",
        json!({ "classGroupId": class_group_id }),
        "not_found",
    );
    let scores = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "scores.list",
        json!({ "studentId": student_id, "subjectId": subject_id }),
    );
    assert_eq!(scores["entries"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn roster_keeps_enrollment_order_and_moves_append_at_the_end() {
    let workspace = temp_dir("edusmart-members-roster");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let institution_id = register_institution(&mut stdin, &mut reader, "2", "Roster School");
    let class_group_id = create_class(&mut stdin, &mut reader, "3", &institution_id, "CE1");

    let mut ids = Vec::new();
    for (i, (last, first)) in [("Zeta", "A"), ("Alpha", "B"), ("Mid", "C")].iter().enumerate() {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            &format!("e{}", i),
            "students.enroll",
            json!({
                "institutionId": institution_id,
                "classGroupId": class_group_id,
                "lastName": last,
                "firstName": first
            }),
        );
        ids.push(res["studentId"].as_str().expect("studentId").to_string());
    }

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "institutionId": institution_id, "classGroupId": class_group_id }),
    );
    let listed: Vec<&str> = roster["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["id"].as_str().expect("id"))
        .collect();
    // Enrollment order, not alphabetical.
    assert_eq!(listed, ids.iter().map(String::as_str).collect::<Vec<_>>());

    // Moving the first student out and back appends at the roster tail.
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": ids[0], "patch": { "classGroupId": null } }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": ids[0], "patch": { "classGroupId": class_group_id } }),
    );
    let reordered = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "institutionId": institution_id, "classGroupId": class_group_id }),
    );
    let listed: Vec<&str> = reordered["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|s| s["id"].as_str().expect("id"))
        .collect();
    assert_eq!(listed, vec![ids[1].as_str(), ids[2].as_str(), ids[0].as_str()]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
