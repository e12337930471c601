use crate::grading::{
    AssessKind, GradingError, RawEntry, ScoreSource, StandingPolicy, SubjectConfig,
};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::collections::BTreeMap;

fn query_err(e: rusqlite::Error) -> GradingError {
    GradingError::new("db_query_failed", e.to_string())
}

/// Read-side adapter the aggregation engine pulls rows through. Every query
/// carries an ORDER BY so equal inputs serialize to equal outputs.
pub struct SqliteScores<'a> {
    pub conn: &'a Connection,
}

impl ScoreSource for SqliteScores<'_> {
    fn subject_configs(&self, class_group_id: &str) -> Result<Vec<SubjectConfig>, GradingError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, coefficient, pass_mark, intra_weight, sort_order
                 FROM subjects
                 WHERE class_group_id = ?
                 ORDER BY sort_order, name, id",
            )
            .map_err(query_err)?;
        stmt.query_map([class_group_id], |r| {
            Ok(SubjectConfig {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
                pass_mark: r.get(3)?,
                intra_weight: r.get(4)?,
                sort_order: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
    }

    fn entries(
        &self,
        student_id: &str,
        subject_id: &str,
        sessions: &[i64],
    ) -> Result<Vec<RawEntry>, GradingError> {
        if sessions.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat("?")
            .take(sessions.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT session, kind, ordinal, value, recorded_at, rowid
             FROM score_entries
             WHERE student_id = ? AND subject_id = ? AND session IN ({})
             ORDER BY recorded_at, rowid",
            placeholders
        );

        let mut bind: Vec<Value> = Vec::with_capacity(2 + sessions.len());
        bind.push(Value::Text(student_id.to_string()));
        bind.push(Value::Text(subject_id.to_string()));
        for s in sessions {
            bind.push(Value::Integer(*s));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(query_err)?;
        let rows = stmt
            .query_map(params_from_iter(bind), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, f64>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for (session, kind, ordinal, value, recorded_at, seq) in rows {
            let Some(kind) = AssessKind::parse(&kind) else {
                // scores.record refuses unknown kinds, so this row was
                // written out of band.
                return Err(GradingError::new(
                    "db_query_failed",
                    format!("score entry with unknown kind '{}'", kind),
                ));
            };
            out.push(RawEntry {
                session,
                kind,
                ordinal,
                value,
                recorded_at,
                seq,
            });
        }
        Ok(out)
    }
}

/// Load the institution's grading policy. Returns None when the institution
/// does not exist.
pub fn load_standing_policy(
    conn: &Connection,
    institution_id: &str,
) -> Result<Option<StandingPolicy>, GradingError> {
    let row: Option<(f64, Option<String>)> = conn
        .query_row(
            "SELECT pass_minimum, session_weights FROM institutions WHERE id = ?",
            [institution_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let Some((pass_minimum, weights_json)) = row else {
        return Ok(None);
    };
    let session_weights = match weights_json {
        None => None,
        Some(raw) => Some(parse_session_weights(&raw)?),
    };
    Ok(Some(StandingPolicy {
        pass_minimum,
        session_weights,
    }))
}

/// session_weights is persisted as a JSON object keyed by session number,
/// e.g. {"1": 1.0, "2": 2.0}. NULL means simple mean.
pub fn parse_session_weights(raw: &str) -> Result<BTreeMap<i64, f64>, GradingError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| GradingError::config(format!("session weights are not valid JSON: {}", e)))?;
    session_weights_from_value(&value)
}

/// Validation shared with institutions.update: keys must be session numbers,
/// weights finite and positive.
pub fn session_weights_from_value(
    value: &serde_json::Value,
) -> Result<BTreeMap<i64, f64>, GradingError> {
    let Some(obj) = value.as_object() else {
        return Err(GradingError::config(
            "session weights must be an object keyed by session number",
        ));
    };
    let mut out = BTreeMap::new();
    for (key, v) in obj {
        let session: i64 = key.parse().map_err(|_| {
            GradingError::config(format!("session weight key '{}' is not a session number", key))
        })?;
        let Some(w) = v.as_f64() else {
            return Err(GradingError::config(format!(
                "session {} weight must be a number",
                session
            )));
        };
        if !w.is_finite() || w <= 0.0 {
            return Err(GradingError::config(format!(
                "session {} weight must be positive",
                session
            )));
        }
        out.insert(session, w);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("edusmartd-store-{}-{}", tag, nanos))
    }

    fn seed_class(conn: &Connection) {
        conn.execute(
            "INSERT INTO institutions(id, name) VALUES ('inst-1', 'College A')",
            [],
        )
        .expect("institution");
        conn.execute(
            "INSERT INTO class_groups(id, institution_id, name) VALUES ('cg-1', 'inst-1', '5e A')",
            [],
        )
        .expect("class group");
        conn.execute(
            "INSERT INTO students(id, institution_id, class_group_id, last_name, first_name, sort_order)
             VALUES ('stu-1', 'inst-1', 'cg-1', 'Diallo', 'Awa', 0)",
            [],
        )
        .expect("student");
    }

    #[test]
    fn subject_configs_ordered_by_sort_then_name() {
        let ws = temp_workspace("configs");
        let conn = open_db(&ws).expect("open");
        seed_class(&conn);
        conn.execute(
            "INSERT INTO subjects(id, class_group_id, name, coefficient, pass_mark, intra_weight, sort_order)
             VALUES ('sub-b', 'cg-1', 'Biology', 1.0, 65.0, 0.3, 1),
                    ('sub-a', 'cg-1', 'Algebra', 2.0, 65.0, 0.3, 0),
                    ('sub-c', 'cg-1', 'Chemistry', 1.0, 65.0, 0.3, 1)",
            [],
        )
        .expect("subjects");

        let source = SqliteScores { conn: &conn };
        let configs = source.subject_configs("cg-1").expect("configs");
        let ids: Vec<&str> = configs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["sub-a", "sub-b", "sub-c"]);
    }

    #[test]
    fn entries_filters_sessions_and_orders_by_recency() {
        let ws = temp_workspace("entries");
        let conn = open_db(&ws).expect("open");
        seed_class(&conn);
        conn.execute(
            "INSERT INTO subjects(id, class_group_id, name, coefficient, pass_mark, intra_weight, sort_order)
             VALUES ('sub-1', 'cg-1', 'Mathematics', 2.0, 65.0, 0.3, 0)",
            [],
        )
        .expect("subject");
        conn.execute(
            "INSERT INTO score_entries(id, student_id, subject_id, session, kind, ordinal, value, recorded_at)
             VALUES ('e1', 'stu-1', 'sub-1', 1, 'continuous', 1, 55.0, '2025-10-02T08:00:00Z'),
                    ('e2', 'stu-1', 'sub-1', 1, 'continuous', 1, 72.0, '2025-10-05T08:00:00Z'),
                    ('e3', 'stu-1', 'sub-1', 2, 'exam', 1, 60.0, '2025-12-01T08:00:00Z')",
            [],
        )
        .expect("entries");

        let source = SqliteScores { conn: &conn };
        let got = source.entries("stu-1", "sub-1", &[1]).expect("rows");
        assert_eq!(got.len(), 2);
        assert!(got[0].recorded_at < got[1].recorded_at);
        assert!(got.iter().all(|e| e.session == 1));

        let none = source.entries("stu-1", "sub-1", &[]).expect("empty");
        assert!(none.is_empty());
    }

    #[test]
    fn standing_policy_parses_weights_and_rejects_bad_json() {
        let ws = temp_workspace("policy");
        let conn = open_db(&ws).expect("open");
        conn.execute(
            "INSERT INTO institutions(id, name, pass_minimum, session_weights)
             VALUES ('inst-1', 'College A', 55.0, '{\"1\": 1.0, \"2\": 2.0}')",
            [],
        )
        .expect("institution");

        let policy = load_standing_policy(&conn, "inst-1")
            .expect("load")
            .expect("exists");
        assert_eq!(policy.pass_minimum, 55.0);
        let weights = policy.session_weights.expect("weights");
        assert_eq!(weights.get(&2), Some(&2.0));

        assert!(load_standing_policy(&conn, "missing")
            .expect("load")
            .is_none());

        let err = parse_session_weights("[1, 2]").unwrap_err();
        assert_eq!(err.code, "config_invalid");
        let err = parse_session_weights("{\"x\": 1.0}").unwrap_err();
        assert_eq!(err.code, "config_invalid");
        let err = parse_session_weights("{\"1\": -1.0}").unwrap_err();
        assert_eq!(err.code, "config_invalid");
    }
}
