use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institution_id = match req.params.get("institutionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institutionId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let level = req
        .params
        .get("level")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });
    let year_id = req
        .params
        .get("yearId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

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

    if let Some(year_id) = year_id.as_deref() {
        let year_exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM academic_years WHERE id = ?", [year_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if year_exists.is_none() {
            return err(&req.id, "not_found", "academic year not found", None);
        }
    }

    let class_group_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_groups(id, institution_id, name, level, year_id)
         VALUES(?, ?, ?, ?, ?)",
        (
            &class_group_id,
            &institution_id,
            &name,
            level.as_deref(),
            year_id.as_deref(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "class_groups" })),
        );
    }

    ok(&req.id, json!({ "classGroupId": class_group_id, "name": name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classGroups": [] }));
    };

    let institution_id = match req.params.get("institutionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institutionId", None),
    };

    // Counts via correlated subqueries to avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           cg.id,
           cg.name,
           cg.level,
           cg.year_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_group_id = cg.id) AS student_count,
           (SELECT COUNT(*) FROM subjects sub WHERE sub.class_group_id = cg.id) AS subject_count
         FROM class_groups cg
         WHERE cg.institution_id = ?
         ORDER BY cg.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&institution_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let level: Option<String> = row.get(2)?;
            let year_id: Option<String> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let subject_count: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "level": level,
                "yearId": year_id,
                "studentCount": student_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(class_groups) => ok(&req.id, json!({ "classGroups": class_groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_group_id = match req.params.get("classGroupId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classGroupId", None),
    };

    let exists: Option<i64> = match conn
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
    if exists.is_none() {
        return err(&req.id, "not_found", "class group not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE). Students
    // survive the class group: they fall back to unassigned.
    if let Err(e) = tx.execute(
        "DELETE FROM score_entries
         WHERE subject_id IN (SELECT id FROM subjects WHERE class_group_id = ?)",
        [&class_group_id],
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
        "DELETE FROM subjects WHERE class_group_id = ?",
        [&class_group_id],
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
        "UPDATE students SET class_group_id = NULL,
                updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE class_group_id = ?",
        [&class_group_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM class_groups WHERE id = ?", [&class_group_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "class_groups" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
