use crate::grading::AssessKind;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing/invalid {}", key), None))
}

fn handle_scores_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let session = match required_i64(req, "session") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if session < 1 {
        return err(&req.id, "bad_params", "session must be >= 1", None);
    }
    let kind = match req.params.get("kind").and_then(|v| v.as_str()) {
        Some(v) => match AssessKind::parse(v) {
            Some(k) => k,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "kind must be one of: continuous, exam",
                    Some(json!({ "kind": v })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing kind", None),
    };
    let ordinal = match required_i64(req, "ordinal") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if ordinal < 1 {
        return err(&req.id, "bad_params", "ordinal must be >= 1", None);
    }
    let value = match req.params.get("value").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid value", None),
    };
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return err(
            &req.id,
            "bad_params",
            format!("value {} outside [0,100]", value),
            None,
        );
    }

    let student_class: Option<Option<String>> = match conn
        .query_row(
            "SELECT class_group_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_class) = student_class else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let subject_class: Option<String> = match conn
        .query_row(
            "SELECT class_group_id FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(subject_class) = subject_class else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    if student_class.as_deref() != Some(subject_class.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "student is not enrolled in the subject's class group",
            None,
        );
    }

    // Corrections are new rows; supersession picks the latest at read time.
    let entry_id = Uuid::new_v4().to_string();
    let recorded_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO score_entries(id, student_id, subject_id, session, kind, ordinal, value, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &entry_id,
            &student_id,
            &subject_id,
            session,
            kind.as_str(),
            ordinal,
            value,
            &recorded_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "score_entries" })),
        );
    }

    ok(
        &req.id,
        json!({ "entryId": entry_id, "recordedAt": recorded_at }),
    )
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let sessions: Option<Vec<i64>> = match req.params.get("sessions") {
        None => None,
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return err(&req.id, "bad_params", "sessions must be an array", None);
            };
            let mut out = Vec::with_capacity(arr.len());
            for s in arr {
                let Some(n) = s.as_i64() else {
                    return err(&req.id, "bad_params", "sessions must contain integers", None);
                };
                out.push(n);
            }
            Some(out)
        }
    };

    let mut stmt = match conn.prepare(
        "SELECT id, session, kind, ordinal, value, recorded_at, rowid
         FROM score_entries
         WHERE student_id = ? AND subject_id = ?
         ORDER BY session, kind, ordinal, recorded_at, rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    type EntryRow = (String, i64, String, i64, f64, String, i64);
    let rows: Vec<EntryRow> = match stmt
        .query_map((&student_id, &subject_id), |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows: Vec<EntryRow> = match sessions {
        None => rows,
        Some(filter) => rows
            .into_iter()
            .filter(|r| filter.contains(&r.1))
            .collect(),
    };

    // Effective entry per (session, kind, ordinal): latest recorded_at,
    // rowid breaking same-second ties. Everything else is superseded.
    let mut winner: BTreeMap<(i64, String, i64), (String, i64)> = BTreeMap::new();
    for (_, session, kind, ordinal, _, recorded_at, seq) in &rows {
        let key = (*session, kind.clone(), *ordinal);
        match winner.get(&key) {
            Some((best_at, best_seq)) if (best_at.as_str(), *best_seq) >= (recorded_at.as_str(), *seq) => {}
            _ => {
                winner.insert(key, (recorded_at.clone(), *seq));
            }
        }
    }

    let entries: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, session, kind, ordinal, value, recorded_at, seq)| {
            let superseded = winner
                .get(&(*session, kind.clone(), *ordinal))
                .map(|(_, best_seq)| best_seq != seq)
                .unwrap_or(false);
            json!({
                "id": id,
                "session": session,
                "kind": kind,
                "ordinal": ordinal,
                "value": value,
                "recordedAt": recorded_at,
                "superseded": superseded
            })
        })
        .collect();

    ok(&req.id, json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_scores_record(state, req)),
        "scores.list" => Some(handle_scores_list(state, req)),
        _ => None,
    }
}
