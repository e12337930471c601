use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_plans_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let amount = match req.params.get("amount").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid amount", None),
    };
    if !amount.is_finite() || amount < 0.0 {
        return err(&req.id, "bad_params", "amount must be >= 0", None);
    }
    let frequency = req
        .params
        .get("frequency")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });

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

    let plan_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO payment_plans(id, institution_id, name, amount, frequency)
         VALUES(?, ?, ?, ?, ?)",
        (
            &plan_id,
            &institution_id,
            &name,
            amount,
            frequency.as_deref(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "payment_plans" })),
        );
    }

    ok(&req.id, json!({ "planId": plan_id, "name": name }))
}

fn handle_plans_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let institution_id = match req.params.get("institutionId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing institutionId", None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, amount, frequency
         FROM payment_plans
         WHERE institution_id = ?
         ORDER BY name, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&institution_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let amount: f64 = row.get(2)?;
            let frequency: Option<String> = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "amount": amount,
                "frequency": frequency
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(plans) => ok(&req.id, json!({ "plans": plans })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let plan_id = match req.params.get("planId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing planId", None),
    };
    let amount_paid = match req.params.get("amountPaid").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid amountPaid", None),
    };
    if !amount_paid.is_finite() || amount_paid <= 0.0 {
        return err(&req.id, "bad_params", "amountPaid must be > 0", None);
    }
    let paid_on = match req.params.get("paidOn").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing paidOn", None),
    };
    if chrono::NaiveDate::parse_from_str(&paid_on, "%Y-%m-%d").is_err() {
        return err(&req.id, "bad_params", "paidOn must be YYYY-MM-DD", None);
    }
    let method = req
        .params
        .get("method")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .and_then(|s| if s.is_empty() { None } else { Some(s) });

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

    let plan_institution: Option<String> = match conn
        .query_row(
            "SELECT institution_id FROM payment_plans WHERE id = ?",
            [&plan_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(plan_institution) = plan_institution else {
        return err(&req.id, "not_found", "payment plan not found", None);
    };
    if plan_institution != student_institution {
        return err(
            &req.id,
            "bad_params",
            "payment plan belongs to another institution",
            None,
        );
    }

    let payment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO payments(id, student_id, plan_id, paid_on, amount_paid, method)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            &student_id,
            &plan_id,
            &paid_on,
            amount_paid,
            method.as_deref(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "payments" })),
        );
    }

    ok(&req.id, json!({ "paymentId": payment_id }))
}

fn handle_payments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let student_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.plan_id, pp.name, p.paid_on, p.amount_paid, p.method
         FROM payments p
         JOIN payment_plans pp ON pp.id = p.plan_id
         WHERE p.student_id = ?
         ORDER BY p.paid_on, p.rowid",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows: Vec<(serde_json::Value, f64)> = match stmt
        .query_map([&student_id], |row| {
            let id: String = row.get(0)?;
            let plan_id: String = row.get(1)?;
            let plan_name: String = row.get(2)?;
            let paid_on: String = row.get(3)?;
            let amount_paid: f64 = row.get(4)?;
            let method: Option<String> = row.get(5)?;
            let j = json!({
                "id": id,
                "planId": plan_id,
                "planName": plan_name,
                "paidOn": paid_on,
                "amountPaid": amount_paid,
                "method": method
            });
            Ok((j, amount_paid))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let total_paid: f64 = rows.iter().map(|(_, amount)| amount).sum();
    let payments: Vec<serde_json::Value> = rows.into_iter().map(|(j, _)| j).collect();

    ok(
        &req.id,
        json!({ "payments": payments, "totalPaid": total_paid }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "payments.plans.create" => Some(handle_plans_create(state, req)),
        "payments.plans.list" => Some(handle_plans_list(state, req)),
        "payments.record" => Some(handle_payments_record(state, req)),
        "payments.list" => Some(handle_payments_list(state, req)),
        _ => None,
    }
}
