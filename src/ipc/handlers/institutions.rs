use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) })
}

fn handle_institutions_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let address = optional_str(req, "address");
    let phone = optional_str(req, "phone");
    let director = optional_str(req, "director");
    let email = optional_str(req, "email");
    let logo_ref = optional_str(req, "logoRef");
    let kind = optional_str(req, "kind").unwrap_or_else(|| "classique".to_string());

    let pass_minimum = match req.params.get("passMinimum") {
        None => 60.0,
        Some(v) => match v.as_f64() {
            Some(p) if p.is_finite() && (0.0..=100.0).contains(&p) => p,
            Some(p) => {
                return err(
                    &req.id,
                    "config_invalid",
                    format!("passMinimum {} outside [0,100]", p),
                    None,
                )
            }
            None => return err(&req.id, "bad_params", "passMinimum must be a number", None),
        },
    };

    let institution_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO institutions(id, name, address, phone, director, email, logo_ref, kind, active, pass_minimum)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &institution_id,
            &name,
            address.as_deref(),
            phone.as_deref(),
            director.as_deref(),
            email.as_deref(),
            logo_ref.as_deref(),
            &kind,
            pass_minimum,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "institutions" })),
        );
    }

    ok(
        &req.id,
        json!({ "institutionId": institution_id, "name": name }),
    )
}

fn handle_institutions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "institutions": [] }));
    };

    // Counts via correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           i.id,
           i.name,
           i.kind,
           i.active,
           (SELECT COUNT(*) FROM class_groups cg WHERE cg.institution_id = i.id) AS class_group_count,
           (SELECT COUNT(*) FROM students s WHERE s.institution_id = i.id) AS student_count
         FROM institutions i
         ORDER BY i.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let active: i64 = row.get(3)?;
            let class_group_count: i64 = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "kind": kind,
                "active": active != 0,
                "classGroupCount": class_group_count,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(institutions) => ok(&req.id, json!({ "institutions": institutions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_institutions_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let institution_id = match required_str(req, "institutionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    type Row = (
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
        i64,
        f64,
        Option<String>,
    );
    let row: Option<Row> = match conn
        .query_row(
            "SELECT id, name, address, phone, director, email, logo_ref, kind, active,
                    pass_minimum, session_weights
             FROM institutions WHERE id = ?",
            [&institution_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((id, name, address, phone, director, email, logo_ref, kind, active, pass_minimum, weights_raw)) =
        row
    else {
        return err(&req.id, "not_found", "institution not found", None);
    };

    let session_weights = match weights_raw {
        None => serde_json::Value::Null,
        Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(v) => v,
            Err(e) => {
                return err(
                    &req.id,
                    "config_invalid",
                    format!("stored session weights are not valid JSON: {}", e),
                    None,
                )
            }
        },
    };

    ok(
        &req.id,
        json!({
            "id": id,
            "name": name,
            "address": address,
            "phone": phone,
            "director": director,
            "email": email,
            "logoRef": logo_ref,
            "kind": kind,
            "active": active != 0,
            "passMinimum": pass_minimum,
            "sessionWeights": session_weights
        }),
    )
}

fn handle_institutions_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let institution_id = match required_str(req, "institutionId") {
        Ok(v) => v,
        Err(e) => return e,
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
    for (key, column) in [
        ("address", "address"),
        ("phone", "phone"),
        ("director", "director"),
        ("email", "email"),
        ("logoRef", "logo_ref"),
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
    if let Some(v) = patch.get("kind") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.kind must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "kind must not be empty", None);
        }
        set_parts.push("kind = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return err(&req.id, "bad_params", "patch.active must be a boolean", None);
        };
        set_parts.push("active = ?".into());
        bind_values.push(Value::Integer(if b { 1 } else { 0 }));
    }
    if let Some(v) = patch.get("passMinimum") {
        let Some(p) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.passMinimum must be a number", None);
        };
        if !p.is_finite() || !(0.0..=100.0).contains(&p) {
            return err(
                &req.id,
                "config_invalid",
                format!("passMinimum {} outside [0,100]", p),
                None,
            );
        }
        set_parts.push("pass_minimum = ?".into());
        bind_values.push(Value::Real(p));
    }
    if let Some(v) = patch.get("sessionWeights") {
        if v.is_null() {
            set_parts.push("session_weights = ?".into());
            bind_values.push(Value::Null);
        } else {
            if let Err(e) = store::session_weights_from_value(v) {
                return err(&req.id, &e.code, e.message, e.details);
            }
            let raw = match serde_json::to_string(v) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
            };
            set_parts.push("session_weights = ?".into());
            bind_values.push(Value::Text(raw));
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

    let sql = format!(
        "UPDATE institutions SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(institution_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "institutions" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "institution not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_institutions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let institution_id = match required_str(req, "institutionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
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
    if exists.is_none() {
        return err(&req.id, "not_found", "institution not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM payments
         WHERE student_id IN (SELECT id FROM students WHERE institution_id = ?)",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "payments" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records
         WHERE student_id IN (SELECT id FROM students WHERE institution_id = ?)",
        [&institution_id],
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
        "DELETE FROM score_entries
         WHERE student_id IN (SELECT id FROM students WHERE institution_id = ?)",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "score_entries" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM students WHERE institution_id = ?",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM subjects
         WHERE class_group_id IN (SELECT id FROM class_groups WHERE institution_id = ?)",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM class_groups WHERE institution_id = ?",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_groups" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM payment_plans WHERE institution_id = ?",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "payment_plans" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM subscriptions WHERE institution_id = ?",
        [&institution_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subscriptions" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM institutions WHERE id = ?", [&institution_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "institutions" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subscriptions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let institution_id = match required_str(req, "institutionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match required_str(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match required_str(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    for (key, value) in [("startDate", &start_date), ("endDate", &end_date)] {
        if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_err() {
            return err(
                &req.id,
                "bad_params",
                format!("{} must be YYYY-MM-DD", key),
                Some(json!({ key: value })),
            );
        }
    }
    let status = optional_str(req, "status").unwrap_or_else(|| "active".to_string());

    let exists: Option<i64> = match conn
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
    if exists.is_none() {
        return err(&req.id, "not_found", "institution not found", None);
    }

    let subscription_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subscriptions(id, institution_id, start_date, end_date, status)
         VALUES(?, ?, ?, ?, ?)",
        (
            &subscription_id,
            &institution_id,
            &start_date,
            &end_date,
            &status,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subscriptions" })),
        );
    }

    ok(&req.id, json!({ "subscriptionId": subscription_id }))
}

fn handle_subscriptions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let institution_id = match required_str(req, "institutionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, start_date, end_date, status
         FROM subscriptions
         WHERE institution_id = ?
         ORDER BY start_date, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let rows = stmt
        .query_map([&institution_id], |row| {
            let id: String = row.get(0)?;
            let start_date: String = row.get(1)?;
            let end_date: String = row.get(2)?;
            let status: String = row.get(3)?;
            let current = status == "active"
                && start_date.as_str() <= today.as_str()
                && today.as_str() <= end_date.as_str();
            Ok(json!({
                "id": id,
                "startDate": start_date,
                "endDate": end_date,
                "status": status,
                "current": current
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subscriptions) => ok(&req.id, json!({ "subscriptions": subscriptions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "institutions.register" => Some(handle_institutions_register(state, req)),
        "institutions.list" => Some(handle_institutions_list(state, req)),
        "institutions.get" => Some(handle_institutions_get(state, req)),
        "institutions.update" => Some(handle_institutions_update(state, req)),
        "institutions.delete" => Some(handle_institutions_delete(state, req)),
        "subscriptions.create" => Some(handle_subscriptions_create(state, req)),
        "subscriptions.list" => Some(handle_subscriptions_list(state, req)),
        _ => None,
    }
}
