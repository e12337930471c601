use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) })
}

fn handle_students_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institution_id = match req.params.get("institutionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institutionId", None),
    };
    let last_name = match req.params.get("lastName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing lastName", None),
    };
    let first_name = match req.params.get("firstName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing firstName", None),
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "firstName/lastName must not be empty",
            None,
        );
    }

    let class_group_id = req
        .params
        .get("classGroupId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let registration_no = optional_str(req, "registrationNo");
    let birth_date = optional_str(req, "birthDate");
    let birth_place = optional_str(req, "birthPlace");
    let address = optional_str(req, "address");
    let phone = optional_str(req, "phone");
    let email = optional_str(req, "email");
    let photo_ref = optional_str(req, "photoRef");
    let document_ref = optional_str(req, "documentRef");

    let institution_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM institutions WHERE id = ?",
            [&institution_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if institution_exists.is_none() {
        return err(&req.id, "not_found", "institution not found", None);
    }

    if let Some(class_group_id) = class_group_id.as_deref() {
        let class_institution: Option<String> = match conn
            .query_row(
                "SELECT institution_id FROM class_groups WHERE id = ?",
                [class_group_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match class_institution {
            None => return err(&req.id, "not_found", "class group not found", None),
            Some(owner) if owner != institution_id => {
                return err(
                    &req.id,
                    "bad_params",
                    "class group belongs to another institution",
                    None,
                )
            }
            Some(_) => {}
        }
    }

    // Roster position: end of the class group, or of the institution's
    // unassigned pool.
    let sort_order: i64 = match class_group_id.as_deref() {
        Some(cg) => match conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_group_id = ?",
            [cg],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
        None => match conn.query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students
             WHERE institution_id = ? AND class_group_id IS NULL",
            [&institution_id],
            |r| r.get(0),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        },
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(
           id,
           institution_id,
           class_group_id,
           last_name,
           first_name,
           registration_no,
           birth_date,
           birth_place,
           address,
           phone,
           email,
           photo_ref,
           document_ref,
           sort_order,
           updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &institution_id,
            class_group_id.as_deref(),
            &last_name,
            &first_name,
            registration_no.as_deref(),
            birth_date.as_deref(),
            birth_place.as_deref(),
            address.as_deref(),
            phone.as_deref(),
            email.as_deref(),
            photo_ref.as_deref(),
            document_ref.as_deref(),
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institution_id = match req.params.get("institutionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institutionId", None),
    };
    let class_group_id = req
        .params
        .get("classGroupId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Class roster keeps its configured order; the institution-wide list is
    // alphabetical.
    let (sql, binds): (&str, Vec<String>) = match class_group_id {
        Some(cg) => (
            "SELECT id, last_name, first_name, registration_no, birth_date, class_group_id, sort_order
             FROM students
             WHERE institution_id = ? AND class_group_id = ?
             ORDER BY sort_order",
            vec![institution_id.clone(), cg],
        ),
        None => (
            "SELECT id, last_name, first_name, registration_no, birth_date, class_group_id, sort_order
             FROM students
             WHERE institution_id = ?
             ORDER BY last_name, first_name, id",
            vec![institution_id.clone()],
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |row| {
            let id: String = row.get(0)?;
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let registration_no: Option<String> = row.get(3)?;
            let birth_date: Option<String> = row.get(4)?;
            let class_group_id: Option<String> = row.get(5)?;
            let sort_order: i64 = row.get(6)?;
            let display_name = format!("{}, {}", last_name, first_name);
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": display_name,
                "registrationNo": registration_no,
                "birthDate": birth_date,
                "classGroupId": class_group_id,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let student_institution: Option<String> = match conn
        .query_row(
            "SELECT institution_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_institution) = student_institution else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, column) in [("lastName", "last_name"), ("firstName", "first_name")] {
        if let Some(v) = patch.get(key) {
            let Some(s) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string", key),
                    None,
                );
            };
            let s = s.trim().to_string();
            if s.is_empty() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} must not be empty", key),
                    None,
                );
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Text(s));
        }
    }
    for (key, column) in [
        ("registrationNo", "registration_no"),
        ("birthDate", "birth_date"),
        ("birthPlace", "birth_place"),
        ("address", "address"),
        ("phone", "phone"),
        ("email", "email"),
        ("photoRef", "photo_ref"),
        ("documentRef", "document_ref"),
    ] {
        if let Some(v) = patch.get(key) {
            if v.is_null() {
                set_parts.push(format!("{} = ?", column));
                bind_values.push(Value::Null);
            } else if let Some(s) = v.as_str() {
                let t = s.trim().to_string();
                set_parts.push(format!("{} = ?", column));
                if t.is_empty() {
                    bind_values.push(Value::Null);
                } else {
                    bind_values.push(Value::Text(t));
                }
            } else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string or null", key),
                    None,
                );
            }
        }
    }

    if let Some(v) = patch.get("classGroupId") {
        if v.is_null() {
            set_parts.push("class_group_id = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(cg) = v.as_str() {
            let class_institution: Option<String> = match conn
                .query_row(
                    "SELECT institution_id FROM class_groups WHERE id = ?",
                    [cg],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            match class_institution {
                None => return err(&req.id, "not_found", "class group not found", None),
                Some(owner) if owner != student_institution => {
                    return err(
                        &req.id,
                        "bad_params",
                        "class group belongs to another institution",
                        None,
                    )
                }
                Some(_) => {}
            }
            // Reassignment drops the student at the end of the new roster.
            let next_sort: i64 = match conn.query_row(
                "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_group_id = ?",
                [cg],
                |r| r.get(0),
            ) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            set_parts.push("class_group_id = ?".into());
            bind_values.push(Value::Text(cg.to_string()));
            set_parts.push("sort_order = ?".into());
            bind_values.push(Value::Integer(next_sort));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.classGroupId must be a string or null",
                None,
            );
        }
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute("DELETE FROM payments WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "payments" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM score_entries WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "score_entries" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.enroll" => Some(handle_students_enroll(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
