use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Configuration bounds enforced at write time so aggregation never sees a
// bad subject row: coefficient >= 0, pass mark on the 0-100 scale, intra
// weight inside [0,1].

fn check_coefficient(id: &str, v: f64) -> Result<(), serde_json::Value> {
    if !v.is_finite() || v < 0.0 {
        return Err(err(
            id,
            "config_invalid",
            format!("coefficient {} must be >= 0", v),
            None,
        ));
    }
    Ok(())
}

fn check_pass_mark(id: &str, v: f64) -> Result<(), serde_json::Value> {
    if !v.is_finite() || !(0.0..=100.0).contains(&v) {
        return Err(err(
            id,
            "config_invalid",
            format!("passMark {} outside [0,100]", v),
            None,
        ));
    }
    Ok(())
}

fn check_intra_weight(id: &str, v: f64) -> Result<(), serde_json::Value> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(err(
            id,
            "config_invalid",
            format!("intraWeight {} outside [0,1]", v),
            None,
        ));
    }
    Ok(())
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_group_id = match req.params.get("classGroupId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classGroupId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let coefficient = match req.params.get("coefficient") {
        None => 1.0,
        Some(v) => match v.as_f64() {
            Some(c) => c,
            None => return err(&req.id, "bad_params", "coefficient must be a number", None),
        },
    };
    if let Err(e) = check_coefficient(&req.id, coefficient) {
        return e;
    }
    let pass_mark = match req.params.get("passMark") {
        None => 65.0,
        Some(v) => match v.as_f64() {
            Some(p) => p,
            None => return err(&req.id, "bad_params", "passMark must be a number", None),
        },
    };
    if let Err(e) = check_pass_mark(&req.id, pass_mark) {
        return e;
    }
    let intra_weight = match req.params.get("intraWeight") {
        None => 0.3,
        Some(v) => match v.as_f64() {
            Some(w) => w,
            None => return err(&req.id, "bad_params", "intraWeight must be a number", None),
        },
    };
    if let Err(e) = check_intra_weight(&req.id, intra_weight) {
        return e;
    }

    let class_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM class_groups WHERE id = ?",
            [&class_group_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class group not found", None);
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects WHERE class_group_id = ?",
        [&class_group_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, class_group_id, name, coefficient, pass_mark, intra_weight, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &class_group_id,
            &name,
            coefficient,
            pass_mark,
            intra_weight,
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_group_id = match req.params.get("classGroupId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classGroupId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, coefficient, pass_mark, intra_weight, sort_order
         FROM subjects
         WHERE class_group_id = ?
         ORDER BY sort_order, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&class_group_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let coefficient: f64 = row.get(2)?;
            let pass_mark: f64 = row.get(3)?;
            let intra_weight: f64 = row.get(4)?;
            let sort_order: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "coefficient": coefficient,
                "passMark": pass_mark,
                "intraWeight": intra_weight,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.name must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        set_parts.push("name = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("coefficient") {
        let Some(c) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.coefficient must be a number", None);
        };
        if let Err(e) = check_coefficient(&req.id, c) {
            return e;
        }
        set_parts.push("coefficient = ?".into());
        bind_values.push(Value::Real(c));
    }
    if let Some(v) = patch.get("passMark") {
        let Some(p) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.passMark must be a number", None);
        };
        if let Err(e) = check_pass_mark(&req.id, p) {
            return e;
        }
        set_parts.push("pass_mark = ?".into());
        bind_values.push(Value::Real(p));
    }
    if let Some(v) = patch.get("intraWeight") {
        let Some(w) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.intraWeight must be a number", None);
        };
        if let Err(e) = check_intra_weight(&req.id, w) {
            return e;
        }
        set_parts.push("intra_weight = ?".into());
        bind_values.push(Value::Real(w));
    }
    if let Some(v) = patch.get("sortOrder") {
        let Some(o) = v.as_i64() else {
            return err(&req.id, "bad_params", "patch.sortOrder must be an integer", None);
        };
        set_parts.push("sort_order = ?".into());
        bind_values.push(Value::Integer(o));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(subject_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "subject not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM score_entries WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "score_entries" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
