use serde::Serialize;
use std::collections::BTreeMap;

/// Assessment kind of a score entry: recurring in-class evaluation versus a
/// final/exam-like sitting. The blend between the two is the subject's
/// intra weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AssessKind {
    Continuous,
    Exam,
}

impl AssessKind {
    pub fn parse(s: &str) -> Option<AssessKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" => Some(AssessKind::Continuous),
            "exam" => Some(AssessKind::Exam),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssessKind::Continuous => "continuous",
            AssessKind::Exam => "exam",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GradingError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl GradingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new("config_invalid", message)
    }
}

/// One-decimal rounding used on every projected mark:
/// `Int(10*x + 0.5) / 10`. Applied at the report boundary only, never
/// during aggregation.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Share pair resolved from a subject's intra weight: continuous share `w`,
/// exam share `1 - w`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub continuous: f64,
    pub exam: f64,
}

/// Rejects any intra weight outside [0,1]. Subject setup must refuse such
/// configurations before aggregation ever runs; hitting this during a report
/// means the row was edited out of band.
pub fn blend_weights(intra_weight: f64) -> Result<BlendWeights, GradingError> {
    if !intra_weight.is_finite() || !(0.0..=1.0).contains(&intra_weight) {
        return Err(GradingError::config(format!(
            "intra weight {} outside [0,1]",
            intra_weight
        )));
    }
    Ok(BlendWeights {
        continuous: intra_weight,
        exam: 1.0 - intra_weight,
    })
}

/// Subject configuration as persisted: weight in the overall standing,
/// pass threshold on the 0-100 scale, and the intra/exam blend weight.
#[derive(Debug, Clone)]
pub struct SubjectConfig {
    pub id: String,
    pub name: String,
    pub coefficient: f64,
    pub pass_mark: f64,
    pub intra_weight: f64,
    pub sort_order: i64,
}

/// A persisted score row as the source hands it over. `seq` is the store's
/// insertion counter; recency supersession keys off (recorded_at, seq).
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub session: i64,
    pub kind: AssessKind,
    pub ordinal: i64,
    pub value: f64,
    pub recorded_at: String,
    pub seq: i64,
}

/// Read access the engine needs from the persistence collaborator. The
/// engine never touches a database driver; handlers supply an implementation
/// scoped to the requesting institution/class.
pub trait ScoreSource {
    fn subject_configs(&self, class_group_id: &str) -> Result<Vec<SubjectConfig>, GradingError>;
    fn entries(
        &self,
        student_id: &str,
        subject_id: &str,
        sessions: &[i64],
    ) -> Result<Vec<RawEntry>, GradingError>;
}

/// Institution-level grading policy: overall pass minimum, and the optional
/// per-session weighting for combining term marks (None = simple mean).
#[derive(Debug, Clone)]
pub struct StandingPolicy {
    pub pass_minimum: f64,
    pub session_weights: Option<BTreeMap<i64, f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkStatus {
    Pass,
    Fail,
    Incomplete,
}

/// Exactly-at-threshold counts as Pass; an undefined mark is Incomplete,
/// never zero.
pub fn classify_subject(final_mark: Option<f64>, pass_mark: f64) -> MarkStatus {
    match final_mark {
        None => MarkStatus::Incomplete,
        Some(m) if m >= pass_mark => MarkStatus::Pass,
        Some(_) => MarkStatus::Fail,
    }
}

/// Session-level outcome at full precision. `mark` is None when neither
/// group has an entry ("no data"); `partial` marks the degraded mode where
/// only one group contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session: i64,
    pub continuous_mean: Option<f64>,
    pub exam_mean: Option<f64>,
    pub mark: Option<f64>,
    pub partial: bool,
}

/// Full-precision per-subject outcome, prior to projection rounding.
#[derive(Debug, Clone)]
pub struct SubjectOutcome {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
    pub pass_mark: f64,
    pub sessions: Vec<SessionOutcome>,
    pub final_mark: Option<f64>,
    pub provisional: bool,
    pub status: MarkStatus,
}

/// Input to the overall-standing roll-up, also usable by callers that carry
/// marks from elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct SubjectStanding {
    pub final_mark: Option<f64>,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverallStanding {
    pub average: Option<f64>,
    pub status: MarkStatus,
}

fn group_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / (values.len() as f64))
}

/// Supersession: for each (session, kind, ordinal) key keep the most recent
/// entry, later insertion winning ties within the same second. Corrections
/// are new rows, so the raw slice may carry several entries per key.
pub fn effective_entries(entries: &[RawEntry]) -> Vec<RawEntry> {
    let mut best: BTreeMap<(i64, AssessKind, i64), &RawEntry> = BTreeMap::new();
    for e in entries {
        let key = (e.session, e.kind, e.ordinal);
        match best.get(&key) {
            Some(cur) if (cur.recorded_at.as_str(), cur.seq) >= (e.recorded_at.as_str(), e.seq) => {}
            _ => {
                best.insert(key, e);
            }
        }
    }
    best.into_values().cloned().collect()
}

/// Blend the two group means into a session mark. Both defined: weighted
/// blend. Exactly one defined: that mean alone, flagged partial so reports
/// can mark it provisional. Neither: no data, distinct from zero.
pub fn session_mark(
    session: i64,
    continuous_mean: Option<f64>,
    exam_mean: Option<f64>,
    blend: BlendWeights,
) -> SessionOutcome {
    let (mark, partial) = match (continuous_mean, exam_mean) {
        (Some(c), Some(e)) => (Some(c * blend.continuous + e * blend.exam), false),
        (Some(c), None) => (Some(c), true),
        (None, Some(e)) => (Some(e), true),
        (None, None) => (None, false),
    };
    SessionOutcome {
        session,
        continuous_mean,
        exam_mean,
        mark,
        partial,
    }
}

/// Combine defined session marks into a subject final mark. Sessions with no
/// data are excluded, not counted as zero. With configured weights the mean
/// is weighted per session (unlisted sessions weigh 1.0); otherwise simple.
/// Returns (final mark, provisional), provisional when any contributing
/// session was partial.
fn combine_sessions(
    sessions: &[SessionOutcome],
    weights: Option<&BTreeMap<i64, f64>>,
) -> (Option<f64>, bool) {
    let mut num = 0.0_f64;
    let mut den = 0.0_f64;
    let mut provisional = false;
    for s in sessions {
        let Some(mark) = s.mark else {
            continue;
        };
        let w = weights
            .and_then(|ws| ws.get(&s.session))
            .copied()
            .unwrap_or(1.0);
        if w <= 0.0 {
            continue;
        }
        num += mark * w;
        den += w;
        if s.partial {
            provisional = true;
        }
    }
    if den > 0.0 {
        (Some(num / den), provisional)
    } else {
        (None, false)
    }
}

/// Per-subject aggregation over the requested sessions: supersede raw rows,
/// partition by kind, mean each group, blend, then combine sessions. Values
/// pass through untouched; range validation belongs to the entry point.
pub fn subject_outcome(
    cfg: &SubjectConfig,
    entries: &[RawEntry],
    sessions: &[i64],
    weights: Option<&BTreeMap<i64, f64>>,
) -> Result<SubjectOutcome, GradingError> {
    let blend = blend_weights(cfg.intra_weight)?;
    let effective = effective_entries(entries);

    let mut outcomes: Vec<SessionOutcome> = Vec::with_capacity(sessions.len());
    for &session in sessions {
        let mut continuous: Vec<f64> = Vec::new();
        let mut exam: Vec<f64> = Vec::new();
        for e in effective.iter().filter(|e| e.session == session) {
            match e.kind {
                AssessKind::Continuous => continuous.push(e.value),
                AssessKind::Exam => exam.push(e.value),
            }
        }
        outcomes.push(session_mark(
            session,
            group_mean(&continuous),
            group_mean(&exam),
            blend,
        ));
    }

    let (final_mark, provisional) = combine_sessions(&outcomes, weights);
    let status = classify_subject(final_mark, cfg.pass_mark);

    Ok(SubjectOutcome {
        subject_id: cfg.id.clone(),
        name: cfg.name.clone(),
        coefficient: cfg.coefficient,
        pass_mark: cfg.pass_mark,
        sessions: outcomes,
        final_mark,
        provisional,
        status,
    })
}

/// Roll subject results into the overall standing. The weighted average runs
/// over required subjects (coefficient > 0) with a defined mark; Incomplete
/// subjects stay out of numerator and denominator but any required one
/// forces the overall status to Incomplete. Coefficient-0 subjects are
/// informational and affect nothing.
pub fn overall_standing(subjects: &[SubjectStanding], pass_minimum: f64) -> OverallStanding {
    let mut num = 0.0_f64;
    let mut den = 0.0_f64;
    let mut required_incomplete = false;
    for s in subjects {
        if s.coefficient <= 0.0 {
            continue;
        }
        match s.final_mark {
            Some(mark) => {
                num += mark * s.coefficient;
                den += s.coefficient;
            }
            None => required_incomplete = true,
        }
    }

    let average = if den > 0.0 { Some(num / den) } else { None };
    let status = if required_incomplete || average.is_none() {
        MarkStatus::Incomplete
    } else if average.map(|a| a >= pass_minimum).unwrap_or(false) {
        MarkStatus::Pass
    } else {
        MarkStatus::Fail
    };

    OverallStanding { average, status }
}

// ---- report projection ----

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLine {
    pub session: i64,
    pub continuous_mean: Option<f64>,
    pub exam_mean: Option<f64>,
    pub mark: Option<f64>,
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
    pub pass_mark: f64,
    pub sessions: Vec<SessionLine>,
    pub final_mark: Option<f64>,
    pub provisional: bool,
    pub status: MarkStatus,
}

/// The ordered, denormalized record set handed to the rendering collaborator.
/// Pure projection over the aggregation outputs: subjects ordered by
/// configured sort order then name, sessions ascending, every mark rounded
/// to one decimal here and nowhere earlier. Recomputing over unchanged rows
/// serializes byte-identically.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCard {
    pub student_id: String,
    pub sessions: Vec<i64>,
    pub subjects: Vec<SubjectLine>,
    pub overall_average: Option<f64>,
    pub standing: MarkStatus,
}

fn round_opt(v: Option<f64>) -> Option<f64> {
    v.map(round_off_1_decimal)
}

fn project_subject(outcome: &SubjectOutcome) -> SubjectLine {
    SubjectLine {
        subject_id: outcome.subject_id.clone(),
        name: outcome.name.clone(),
        coefficient: outcome.coefficient,
        pass_mark: outcome.pass_mark,
        sessions: outcome
            .sessions
            .iter()
            .map(|s| SessionLine {
                session: s.session,
                continuous_mean: round_opt(s.continuous_mean),
                exam_mean: round_opt(s.exam_mean),
                mark: round_opt(s.mark),
                partial: s.partial,
            })
            .collect(),
        final_mark: round_opt(outcome.final_mark),
        provisional: outcome.provisional,
        status: outcome.status,
    }
}

fn normalize_sessions(sessions: &[i64]) -> Vec<i64> {
    let mut out: Vec<i64> = sessions.to_vec();
    out.sort_unstable();
    out.dedup();
    out
}

/// Compute a student's report card for the given session set. Classification
/// runs on full-precision marks; the returned structure carries the rounded
/// projection.
pub fn compute_report_card<S: ScoreSource + ?Sized>(
    source: &S,
    class_group_id: &str,
    student_id: &str,
    sessions: &[i64],
    policy: &StandingPolicy,
) -> Result<ReportCard, GradingError> {
    let sessions = normalize_sessions(sessions);

    let mut configs = source.subject_configs(class_group_id)?;
    configs.sort_by(|a, b| {
        a.sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut outcomes: Vec<SubjectOutcome> = Vec::with_capacity(configs.len());
    for cfg in &configs {
        let entries = source.entries(student_id, &cfg.id, &sessions)?;
        outcomes.push(subject_outcome(
            cfg,
            &entries,
            &sessions,
            policy.session_weights.as_ref(),
        )?);
    }

    let standing_inputs: Vec<SubjectStanding> = outcomes
        .iter()
        .map(|o| SubjectStanding {
            final_mark: o.final_mark,
            coefficient: o.coefficient,
        })
        .collect();
    let overall = overall_standing(&standing_inputs, policy.pass_minimum);

    Ok(ReportCard {
        student_id: student_id.to_string(),
        sessions,
        subjects: outcomes.iter().map(project_subject).collect(),
        overall_average: round_opt(overall.average),
        standing: overall.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session: i64, kind: AssessKind, ordinal: i64, value: f64, seq: i64) -> RawEntry {
        RawEntry {
            session,
            kind,
            ordinal,
            value,
            recorded_at: format!("2025-09-0{}T08:00:00Z", (seq % 9) + 1),
            seq,
        }
    }

    fn cfg(intra_weight: f64, pass_mark: f64, coefficient: f64) -> SubjectConfig {
        SubjectConfig {
            id: "sub-1".to_string(),
            name: "Mathematics".to_string(),
            coefficient,
            pass_mark,
            intra_weight,
            sort_order: 0,
        }
    }

    #[test]
    fn round_off_one_decimal() {
        assert_eq!(round_off_1_decimal(0.0), 0.0);
        assert_eq!(round_off_1_decimal(3.54), 3.5);
        assert_eq!(round_off_1_decimal(3.55), 3.6);
        assert_eq!(round_off_1_decimal(57.4999), 57.5);
        assert_eq!(round_off_1_decimal(63.3333), 63.3);
    }

    #[test]
    fn blend_weights_bounds() {
        assert_eq!(
            blend_weights(0.0).expect("w=0"),
            BlendWeights {
                continuous: 0.0,
                exam: 1.0
            }
        );
        assert_eq!(
            blend_weights(1.0).expect("w=1"),
            BlendWeights {
                continuous: 1.0,
                exam: 0.0
            }
        );
        let b = blend_weights(0.3).expect("w=0.3");
        assert!((b.continuous - 0.3).abs() < 1e-12);
        assert!((b.exam - 0.7).abs() < 1e-12);

        assert_eq!(blend_weights(-0.1).unwrap_err().code, "config_invalid");
        assert_eq!(blend_weights(1.2).unwrap_err().code, "config_invalid");
        assert_eq!(blend_weights(f64::NAN).unwrap_err().code, "config_invalid");
    }

    #[test]
    fn session_mark_blends_both_groups() {
        for w in [0.0, 0.25, 0.3, 0.5, 0.75, 1.0] {
            let blend = blend_weights(w).expect("valid w");
            let out = session_mark(1, Some(75.0), Some(50.0), blend);
            let expected = 75.0 * w + 50.0 * (1.0 - w);
            assert!(
                (out.mark.expect("defined") - expected).abs() < 1e-9,
                "w={}",
                w
            );
            assert!(!out.partial);
        }
    }

    #[test]
    fn session_mark_single_group_is_partial() {
        let blend = blend_weights(0.3).expect("valid w");
        let only_continuous = session_mark(1, Some(90.0), None, blend);
        assert_eq!(only_continuous.mark, Some(90.0));
        assert!(only_continuous.partial);

        let only_exam = session_mark(1, None, Some(40.0), blend);
        assert_eq!(only_exam.mark, Some(40.0));
        assert!(only_exam.partial);
    }

    #[test]
    fn session_mark_no_entries_is_no_data_not_zero() {
        let blend = blend_weights(0.3).expect("valid w");
        let out = session_mark(1, None, None, blend);
        assert_eq!(out.mark, None);
        assert!(!out.partial);
    }

    #[test]
    fn effective_entries_latest_wins() {
        let entries = vec![
            entry(1, AssessKind::Continuous, 1, 55.0, 1),
            entry(1, AssessKind::Continuous, 1, 72.0, 4),
            entry(1, AssessKind::Continuous, 2, 80.0, 2),
            entry(1, AssessKind::Exam, 1, 60.0, 3),
        ];
        let effective = effective_entries(&entries);
        assert_eq!(effective.len(), 3);
        let corrected = effective
            .iter()
            .find(|e| e.kind == AssessKind::Continuous && e.ordinal == 1)
            .expect("corrected entry");
        assert_eq!(corrected.value, 72.0);
    }

    #[test]
    fn effective_entries_same_second_falls_back_to_seq() {
        let mut first = entry(1, AssessKind::Exam, 1, 50.0, 7);
        let mut second = entry(1, AssessKind::Exam, 1, 65.0, 8);
        first.recorded_at = "2025-09-01T08:00:00Z".to_string();
        second.recorded_at = "2025-09-01T08:00:00Z".to_string();
        let effective = effective_entries(&[first, second]);
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].value, 65.0);
    }

    #[test]
    fn out_of_range_values_propagate_unclamped() {
        let entries = vec![entry(1, AssessKind::Continuous, 1, 120.0, 1)];
        let out = subject_outcome(&cfg(1.0, 65.0, 1.0), &entries, &[1], None).expect("aggregate");
        assert_eq!(out.sessions[0].continuous_mean, Some(120.0));
        assert_eq!(out.final_mark, Some(120.0));
    }

    #[test]
    fn classify_boundary_is_pass() {
        assert_eq!(classify_subject(Some(65.0), 65.0), MarkStatus::Pass);
        assert_eq!(classify_subject(Some(64.999), 65.0), MarkStatus::Fail);
        assert_eq!(classify_subject(None, 65.0), MarkStatus::Incomplete);
    }

    #[test]
    fn spec_scenario_blended_fail() {
        // coefficient 2, threshold 65, w 0.3, continuous [70, 80], exam [50]
        let entries = vec![
            entry(1, AssessKind::Continuous, 1, 70.0, 1),
            entry(1, AssessKind::Continuous, 2, 80.0, 2),
            entry(1, AssessKind::Exam, 1, 50.0, 3),
        ];
        let out = subject_outcome(&cfg(0.3, 65.0, 2.0), &entries, &[1], None).expect("aggregate");
        let mark = out.final_mark.expect("defined");
        assert!((mark - 57.5).abs() < 1e-9);
        assert_eq!(out.status, MarkStatus::Fail);
        assert!(!out.provisional);
    }

    #[test]
    fn spec_scenario_degraded_provisional_pass() {
        let entries = vec![entry(1, AssessKind::Continuous, 1, 90.0, 1)];
        let out = subject_outcome(&cfg(0.3, 65.0, 2.0), &entries, &[1], None).expect("aggregate");
        assert_eq!(out.final_mark, Some(90.0));
        assert!(out.provisional);
        assert_eq!(out.status, MarkStatus::Pass);
    }

    #[test]
    fn subject_with_no_entries_is_incomplete() {
        let out = subject_outcome(&cfg(0.3, 65.0, 1.0), &[], &[1, 2], None).expect("aggregate");
        assert_eq!(out.final_mark, None);
        assert_eq!(out.status, MarkStatus::Incomplete);
        for s in &out.sessions {
            assert_eq!(s.mark, None);
        }
    }

    #[test]
    fn no_data_sessions_excluded_from_final() {
        let entries = vec![
            entry(1, AssessKind::Continuous, 1, 70.0, 1),
            entry(1, AssessKind::Exam, 1, 60.0, 2),
        ];
        // Session 2 has no rows at all; the final must equal session 1's mark.
        let out = subject_outcome(&cfg(0.5, 65.0, 1.0), &entries, &[1, 2], None).expect("aggregate");
        let mark = out.final_mark.expect("defined");
        assert!((mark - 65.0).abs() < 1e-9);
        assert_eq!(out.status, MarkStatus::Pass);
    }

    #[test]
    fn session_weights_reweight_defined_sessions() {
        let entries = vec![
            entry(1, AssessKind::Exam, 1, 40.0, 1),
            entry(2, AssessKind::Exam, 1, 80.0, 2),
        ];
        let mut weights = BTreeMap::new();
        weights.insert(1_i64, 1.0_f64);
        weights.insert(2_i64, 3.0_f64);
        let out = subject_outcome(&cfg(0.0, 65.0, 1.0), &entries, &[1, 2], Some(&weights))
            .expect("aggregate");
        let mark = out.final_mark.expect("defined");
        // (40*1 + 80*3) / 4 = 70
        assert!((mark - 70.0).abs() < 1e-9);
    }

    #[test]
    fn overall_weighted_average_scenario() {
        let subjects = vec![
            SubjectStanding {
                final_mark: Some(70.0),
                coefficient: 2.0,
            },
            SubjectStanding {
                final_mark: Some(50.0),
                coefficient: 1.0,
            },
        ];
        let overall = overall_standing(&subjects, 60.0);
        let avg = overall.average.expect("defined");
        assert!((avg - (70.0 * 2.0 + 50.0) / 3.0).abs() < 1e-9);
        assert_eq!(overall.status, MarkStatus::Pass);
    }

    #[test]
    fn overall_incomplete_subject_forces_incomplete_but_average_excludes_it() {
        let subjects = vec![
            SubjectStanding {
                final_mark: Some(90.0),
                coefficient: 2.0,
            },
            SubjectStanding {
                final_mark: None,
                coefficient: 1.0,
            },
        ];
        let overall = overall_standing(&subjects, 60.0);
        assert_eq!(overall.average, Some(90.0));
        assert_eq!(overall.status, MarkStatus::Incomplete);
    }

    #[test]
    fn overall_coefficient_zero_is_informational() {
        let subjects = vec![
            SubjectStanding {
                final_mark: Some(80.0),
                coefficient: 1.0,
            },
            // Incomplete but optional: must not force Incomplete.
            SubjectStanding {
                final_mark: None,
                coefficient: 0.0,
            },
            // Defined but optional: must not move the average.
            SubjectStanding {
                final_mark: Some(10.0),
                coefficient: 0.0,
            },
        ];
        let overall = overall_standing(&subjects, 60.0);
        assert_eq!(overall.average, Some(80.0));
        assert_eq!(overall.status, MarkStatus::Pass);
    }

    #[test]
    fn overall_without_any_defined_required_mark_is_incomplete() {
        let subjects = vec![SubjectStanding {
            final_mark: None,
            coefficient: 2.0,
        }];
        let overall = overall_standing(&subjects, 60.0);
        assert_eq!(overall.average, None);
        assert_eq!(overall.status, MarkStatus::Incomplete);

        let empty = overall_standing(&[], 60.0);
        assert_eq!(empty.average, None);
        assert_eq!(empty.status, MarkStatus::Incomplete);
    }

    struct FakeSource {
        configs: Vec<SubjectConfig>,
        entries: Vec<(String, RawEntry)>,
    }

    impl ScoreSource for FakeSource {
        fn subject_configs(&self, _class_group_id: &str) -> Result<Vec<SubjectConfig>, GradingError> {
            Ok(self.configs.clone())
        }

        fn entries(
            &self,
            _student_id: &str,
            subject_id: &str,
            sessions: &[i64],
        ) -> Result<Vec<RawEntry>, GradingError> {
            Ok(self
                .entries
                .iter()
                .filter(|(sid, e)| sid == subject_id && sessions.contains(&e.session))
                .map(|(_, e)| e.clone())
                .collect())
        }
    }

    fn fake_source() -> FakeSource {
        FakeSource {
            configs: vec![
                SubjectConfig {
                    id: "sub-math".to_string(),
                    name: "Mathematics".to_string(),
                    coefficient: 2.0,
                    pass_mark: 65.0,
                    intra_weight: 0.3,
                    sort_order: 1,
                },
                SubjectConfig {
                    id: "sub-fr".to_string(),
                    name: "French".to_string(),
                    coefficient: 1.0,
                    pass_mark: 65.0,
                    intra_weight: 0.3,
                    sort_order: 0,
                },
            ],
            entries: vec![
                (
                    "sub-math".to_string(),
                    entry(1, AssessKind::Continuous, 1, 70.0, 1),
                ),
                (
                    "sub-math".to_string(),
                    entry(1, AssessKind::Continuous, 2, 80.0, 2),
                ),
                ("sub-math".to_string(), entry(1, AssessKind::Exam, 1, 50.0, 3)),
                (
                    "sub-fr".to_string(),
                    entry(1, AssessKind::Continuous, 1, 90.0, 4),
                ),
                ("sub-fr".to_string(), entry(1, AssessKind::Exam, 1, 70.0, 5)),
            ],
        }
    }

    #[test]
    fn report_card_orders_subjects_and_rounds_at_boundary() {
        let source = fake_source();
        let policy = StandingPolicy {
            pass_minimum: 60.0,
            session_weights: None,
        };
        let card =
            compute_report_card(&source, "class-1", "student-1", &[1], &policy).expect("card");

        // sort_order wins over name: French (0) before Mathematics (1).
        assert_eq!(card.subjects[0].subject_id, "sub-fr");
        assert_eq!(card.subjects[1].subject_id, "sub-math");

        let math = &card.subjects[1];
        assert_eq!(math.final_mark, Some(57.5));
        assert_eq!(math.status, MarkStatus::Fail);

        let fr = &card.subjects[0];
        // 90*0.3 + 70*0.7 = 76
        assert_eq!(fr.final_mark, Some(76.0));
        assert_eq!(fr.status, MarkStatus::Pass);

        // Overall avg = (57.5*2 + 76*1)/3 = 63.666... -> rounded 63.7 in the
        // projection, Pass against minimum 60 on the unrounded value.
        assert_eq!(card.overall_average, Some(63.7));
        assert_eq!(card.standing, MarkStatus::Pass);
    }

    #[test]
    fn report_card_is_deterministic_for_unchanged_entries() {
        let source = fake_source();
        let policy = StandingPolicy {
            pass_minimum: 60.0,
            session_weights: None,
        };
        let a = compute_report_card(&source, "class-1", "student-1", &[2, 1, 1], &policy)
            .expect("first run");
        let b = compute_report_card(&source, "class-1", "student-1", &[1, 2], &policy)
            .expect("second run");
        let a_json = serde_json::to_string(&a).expect("serialize a");
        let b_json = serde_json::to_string(&b).expect("serialize b");
        assert_eq!(a_json, b_json);
        assert_eq!(a.sessions, vec![1, 2]);
    }

    #[test]
    fn report_card_rejects_out_of_band_bad_intra_weight() {
        let mut source = fake_source();
        source.configs[0].intra_weight = 1.5;
        let policy = StandingPolicy {
            pass_minimum: 60.0,
            session_weights: None,
        };
        let err = compute_report_card(&source, "class-1", "student-1", &[1], &policy)
            .expect_err("must reject");
        assert_eq!(err.code, "config_invalid");
    }
}
