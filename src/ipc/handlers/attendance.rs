use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn db_err(code: &'static str, e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn parse_day(raw: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| bad_params("date must be YYYY-MM-DD"))
}

fn parse_status(raw: &str) -> Result<String, HandlerErr> {
    let status = raw.trim().to_ascii_lowercase();
    if !STATUSES.contains(&status.as_str()) {
        return Err(bad_params(
            "status must be one of: present, absent, late, excused",
        ));
    }
    Ok(status)
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

/// One record per student per day; re-recording the same day replaces the
/// status instead of stacking rows.
fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let date = parse_day(&get_required_str(params, "date")?)?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let reason = params
        .get("reason")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_records(id, student_id, date, status, reason)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, date)
         DO UPDATE SET status = excluded.status, reason = excluded.reason",
        (&record_id, &student_id, &date, &status, reason.as_deref()),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;

    // The conflict path keeps the original row id.
    let effective_id: String = conn
        .query_row(
            "SELECT id FROM attendance_records WHERE student_id = ? AND date = ?",
            (&student_id, &date),
            |r| r.get(0),
        )
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "recordId": effective_id, "date": date, "status": status }))
}

fn attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let from = match params.get("from").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_day(raw)?),
        None => None,
    };
    let to = match params.get("to").and_then(|v| v.as_str()) {
        Some(raw) => Some(parse_day(raw)?),
        None => None,
    };

    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let mut sql = String::from(
        "SELECT id, date, status, reason FROM attendance_records WHERE student_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(student_id.clone())];
    if let Some(from) = &from {
        sql.push_str(" AND date >= ?");
        binds.push(Value::Text(from.clone()));
    }
    if let Some(to) = &to {
        sql.push_str(" AND date <= ?");
        binds.push(Value::Text(to.clone()));
    }
    sql.push_str(" ORDER BY date");

    let mut stmt = conn.prepare(&sql).map_err(|e| db_err("db_query_failed", e))?;
    let rows: Vec<(String, String, String, Option<String>)> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut present = 0_i64;
    let mut absent = 0_i64;
    let mut late = 0_i64;
    let mut excused = 0_i64;
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, date, status, reason)| {
            match status.as_str() {
                "present" => present += 1,
                "absent" => absent += 1,
                "late" => late += 1,
                "excused" => excused += 1,
                _ => {}
            }
            json!({
                "id": id,
                "date": date,
                "status": status,
                "reason": reason
            })
        })
        .collect();

    Ok(json!({
        "records": records,
        "counts": {
            "present": present,
            "absent": absent,
            "late": late,
            "excused": excused
        }
    }))
}

fn attendance_day_sheet(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_group_id = get_required_str(params, "classGroupId")?;
    let date = parse_day(&get_required_str(params, "date")?)?;

    let class_name: Option<String> = conn
        .query_row(
            "SELECT name FROM class_groups WHERE id = ?",
            [&class_group_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some(class_name) = class_name else {
        return Err(HandlerErr {
            code: "not_found",
            message: "class group not found".to_string(),
            details: None,
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.sort_order, ar.status, ar.reason
             FROM students s
             LEFT JOIN attendance_records ar
               ON ar.student_id = s.id AND ar.date = ?
             WHERE s.class_group_id = ?
             ORDER BY s.sort_order",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows: Vec<(String, String, String, i64, Option<String>, Option<String>)> = stmt
        .query_map((&date, &class_group_id), |r| {
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
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut present = 0_i64;
    let mut absent = 0_i64;
    let mut late = 0_i64;
    let mut excused = 0_i64;
    let mut unmarked = 0_i64;
    let sheet: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, last, first, sort_order, status, reason)| {
            match status.as_deref() {
                Some("present") => present += 1,
                Some("absent") => absent += 1,
                Some("late") => late += 1,
                Some("excused") => excused += 1,
                _ => unmarked += 1,
            }
            json!({
                "studentId": id,
                "displayName": format!("{}, {}", last, first),
                "sortOrder": sort_order,
                "status": status,
                "reason": reason
            })
        })
        .collect();

    Ok(json!({
        "class": { "id": class_group_id, "name": class_name },
        "date": date,
        "rows": sheet,
        "counts": {
            "present": present,
            "absent": absent,
            "late": late,
            "excused": excused,
            "unmarked": unmarked
        }
    }))
}

fn handle_attendance_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_record(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_day_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_day_sheet(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(handle_attendance_record(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        "attendance.daySheet" => Some(handle_attendance_day_sheet(state, req)),
        _ => None,
    }
}
