use crate::grading;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, SqliteScores};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn grading_err(req: &Request, e: grading::GradingError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}

fn parse_sessions(req: &Request) -> Result<Vec<i64>, serde_json::Value> {
    let Some(arr) = req.params.get("sessions").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing sessions", None));
    };
    if arr.is_empty() {
        return Err(err(&req.id, "bad_params", "sessions must not be empty", None));
    }
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(n) = v.as_i64() else {
            return Err(err(
                &req.id,
                "bad_params",
                "sessions must contain integers",
                None,
            ));
        };
        if n < 1 {
            return Err(err(&req.id, "bad_params", "sessions must be >= 1", None));
        }
        out.push(n);
    }
    Ok(out)
}

/// (name, institution_id) of the class group, or a not_found envelope.
fn class_group_row(
    conn: &Connection,
    req: &Request,
    class_group_id: &str,
) -> Result<(String, String), serde_json::Value> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT name, institution_id FROM class_groups WHERE id = ?",
            [class_group_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    row.ok_or_else(|| err(&req.id, "not_found", "class group not found", None))
}

fn standing_policy(
    conn: &Connection,
    req: &Request,
    institution_id: &str,
) -> Result<grading::StandingPolicy, serde_json::Value> {
    match store::load_standing_policy(conn, institution_id) {
        Ok(Some(policy)) => Ok(policy),
        Ok(None) => Err(err(&req.id, "not_found", "institution not found", None)),
        Err(e) => Err(grading_err(req, e)),
    }
}

fn handle_reports_report_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_group_id = match required_str(req, "classGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sessions = match parse_sessions(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let (class_name, institution_id) = match class_group_row(conn, req, &class_group_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student_row: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT last_name, first_name, class_group_id FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((last_name, first_name, student_class)) = student_row else {
        return err(&req.id, "not_found", "student not found", None);
    };
    if student_class.as_deref() != Some(class_group_id.as_str()) {
        return err(&req.id, "not_found", "student not found in class group", None);
    }

    let policy = match standing_policy(conn, req, &institution_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let source = SqliteScores { conn };
    let card = match grading::compute_report_card(
        &source,
        &class_group_id,
        &student_id,
        &sessions,
        &policy,
    ) {
        Ok(v) => v,
        Err(e) => return grading_err(req, e),
    };

    ok(
        &req.id,
        json!({
            "class": { "id": class_group_id, "name": class_name },
            "student": {
                "id": student_id,
                "displayName": format!("{}, {}", last_name, first_name)
            },
            "passMinimum": policy.pass_minimum,
            "card": card
        }),
    )
}

fn handle_reports_class_standings(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_group_id = match required_str(req, "classGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sessions = match parse_sessions(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let (class_name, institution_id) = match class_group_row(conn, req, &class_group_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let policy = match standing_policy(conn, req, &institution_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, sort_order
         FROM students
         WHERE class_group_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster: Vec<(String, String, String, i64)> = match stmt
        .query_map([&class_group_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    struct Row {
        student_id: String,
        display_name: String,
        sort_order: i64,
        average: Option<f64>,
        standing: grading::MarkStatus,
        provisional: bool,
    }

    let source = SqliteScores { conn };
    let mut rows: Vec<Row> = Vec::with_capacity(roster.len());
    for (student_id, last_name, first_name, sort_order) in roster {
        let card = match grading::compute_report_card(
            &source,
            &class_group_id,
            &student_id,
            &sessions,
            &policy,
        ) {
            Ok(v) => v,
            Err(e) => return grading_err(req, e),
        };
        rows.push(Row {
            student_id,
            display_name: format!("{}, {}", last_name, first_name),
            sort_order,
            average: card.overall_average,
            standing: card.standing,
            provisional: card.subjects.iter().any(|s| s.provisional),
        });
    }

    // Best average first; students without one close the table in name
    // order.
    rows.sort_by(|a, b| match (a.average, b.average) {
        (Some(x), Some(y)) => y
            .partial_cmp(&x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.display_name.cmp(&b.display_name))
            .then_with(|| a.student_id.cmp(&b.student_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a
            .display_name
            .cmp(&b.display_name)
            .then_with(|| a.student_id.cmp(&b.student_id)),
    });

    let standings: Vec<serde_json::Value> = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let rank = row.average.map(|_| (i + 1) as i64);
            json!({
                "rank": rank,
                "studentId": row.student_id,
                "displayName": row.display_name,
                "sortOrder": row.sort_order,
                "average": row.average,
                "standing": row.standing,
                "provisional": row.provisional
            })
        })
        .collect();

    let mut session_set = sessions.clone();
    session_set.sort_unstable();
    session_set.dedup();

    ok(
        &req.id,
        json!({
            "class": { "id": class_group_id, "name": class_name },
            "sessions": session_set,
            "passMinimum": policy.pass_minimum,
            "standings": standings
        }),
    )
}

fn handle_reports_class_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_group_id = match required_str(req, "classGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let (class_name, _) = match class_group_row(conn, req, &class_group_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, registration_no, birth_date, sort_order
         FROM students
         WHERE class_group_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match stmt
        .query_map([&class_group_id], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let registration_no: Option<String> = r.get(3)?;
            let birth_date: Option<String> = r.get(4)?;
            let sort_order: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "displayName": format!("{}, {}", last, first),
                "registrationNo": registration_no,
                "birthDate": birth_date,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "class": { "id": class_group_id, "name": class_name },
            "students": students
        }),
    )
}

fn handle_grading_classify_subject(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let pass_mark = match req.params.get("passMark").and_then(|v| v.as_f64()) {
        Some(v) if v.is_finite() => v,
        _ => return err(&req.id, "bad_params", "missing/invalid passMark", None),
    };
    let mark = match req.params.get("mark") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(m) => Some(m),
            None => return err(&req.id, "bad_params", "mark must be a number or null", None),
        },
    };

    let status = grading::classify_subject(mark, pass_mark);
    ok(&req.id, json!({ "status": status }))
}

fn handle_grading_overall_standing(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let pass_minimum = match req.params.get("passMinimum").and_then(|v| v.as_f64()) {
        Some(v) if v.is_finite() => v,
        _ => return err(&req.id, "bad_params", "missing/invalid passMinimum", None),
    };
    let Some(arr) = req.params.get("subjects").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing subjects", None);
    };

    let mut subjects = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let coefficient = match item.get("coefficient").and_then(|v| v.as_f64()) {
            Some(c) if c.is_finite() && c >= 0.0 => c,
            Some(c) => {
                return err(
                    &req.id,
                    "config_invalid",
                    format!("coefficient {} must be >= 0", c),
                    Some(json!({ "index": i })),
                )
            }
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "subjects[].coefficient must be a number",
                    Some(json!({ "index": i })),
                )
            }
        };
        let final_mark = match item.get("finalMark") {
            None => None,
            Some(v) if v.is_null() => None,
            Some(v) => match v.as_f64() {
                Some(m) => Some(m),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "subjects[].finalMark must be a number or null",
                        Some(json!({ "index": i })),
                    )
                }
            },
        };
        subjects.push(grading::SubjectStanding {
            final_mark,
            coefficient,
        });
    }

    let overall = grading::overall_standing(&subjects, pass_minimum);
    ok(
        &req.id,
        json!({
            "average": overall.average.map(grading::round_off_1_decimal),
            "status": overall.status
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.reportCard" => Some(handle_reports_report_card(state, req)),
        "reports.classStandings" => Some(handle_reports_class_standings(state, req)),
        "reports.classList" => Some(handle_reports_class_list(state, req)),
        "grading.classifySubject" => Some(handle_grading_classify_subject(state, req)),
        "grading.overallStanding" => Some(handle_grading_overall_standing(state, req)),
        _ => None,
    }
}
