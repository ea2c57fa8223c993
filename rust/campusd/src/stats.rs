use serde::{Deserialize, Serialize};

pub const SAFE_THRESHOLD: f64 = 85.0;
pub const LOW_ATTENDANCE_THRESHOLD: f64 = 75.0;

/// Per-subject session counts for one student, as returned by the store.
///
/// Counts are kept signed and unvalidated: whatever the store hands back is
/// aggregated as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i64,
    pub total_sessions: i64,
    pub present_sessions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceBand {
    Safe,
    Warning,
    Danger,
}

impl AttendanceBand {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= SAFE_THRESHOLD {
            Self::Safe
        } else if percentage >= LOW_ATTENDANCE_THRESHOLD {
            Self::Warning
        } else {
            Self::Danger
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Warning => "warning",
            Self::Danger => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubjectStat {
    pub subject_code: String,
    pub subject_name: String,
    pub semester: i64,
    pub total_sessions: i64,
    pub present_sessions: i64,
    pub absent_sessions: i64,
    /// `None` when the subject has no sessions yet (inactive).
    pub percentage: Option<f64>,
    pub band: Option<AttendanceBand>,
}

impl SubjectStat {
    pub fn is_active(&self) -> bool {
        self.percentage.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverallStat {
    pub total_classes: i64,
    pub present_classes: i64,
    /// Mean of active subject percentages, rounded to 2 decimals.
    pub percentage: f64,
    pub active_subjects: usize,
    pub band: AttendanceBand,
    pub low_attendance: bool,
}

impl OverallStat {
    pub fn absent_classes(&self) -> i64 {
        self.total_classes - self.present_classes
    }
}

pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn subject_percentage(total: i64, present: i64) -> Option<f64> {
    if total > 0 {
        Some((present as f64) / (total as f64) * 100.0)
    } else {
        None
    }
}

pub fn compute_subject_stats(records: &[SessionRecord]) -> Vec<SubjectStat> {
    records
        .iter()
        .map(|r| {
            let percentage = subject_percentage(r.total_sessions, r.present_sessions);
            SubjectStat {
                subject_code: r.subject_code.clone(),
                subject_name: r.subject_name.clone(),
                semester: r.semester,
                total_sessions: r.total_sessions,
                present_sessions: r.present_sessions,
                absent_sessions: r.total_sessions - r.present_sessions,
                percentage,
                band: percentage.map(AttendanceBand::from_percentage),
            }
        })
        .collect()
}

/// Overall attendance is the average of subject percentages, not a pooled
/// present/total ratio: a subject with few sessions weighs as much as one
/// with many. Subjects without sessions are left out of the average.
pub fn compute_overall_stats(records: &[SessionRecord]) -> OverallStat {
    let mut total_classes: i64 = 0;
    let mut present_classes: i64 = 0;
    let mut sum_percent: f64 = 0.0;
    let mut active_subjects: usize = 0;

    for r in records {
        total_classes += r.total_sessions;
        present_classes += r.present_sessions;
        if let Some(p) = subject_percentage(r.total_sessions, r.present_sessions) {
            sum_percent += p;
            active_subjects += 1;
        }
    }

    // No active subject: the average of an empty set is 0.
    let mean = if active_subjects > 0 {
        sum_percent / (active_subjects as f64)
    } else {
        0.0
    };
    let percentage = round_2_decimals(mean);

    OverallStat {
        total_classes,
        present_classes,
        percentage,
        active_subjects,
        band: AttendanceBand::from_percentage(percentage),
        low_attendance: percentage < LOW_ATTENDANCE_THRESHOLD,
    }
}

pub fn subject_stat_json(s: &SubjectStat) -> serde_json::Value {
    serde_json::json!({
        "subjectCode": s.subject_code,
        "subjectName": s.subject_name,
        "semester": s.semester,
        "totalSessions": s.total_sessions,
        "presentSessions": s.present_sessions,
        "absentSessions": s.absent_sessions,
        "percentage": s.percentage.map(round_2_decimals),
        "band": s.band.map(AttendanceBand::as_str),
    })
}

pub fn overall_stat_json(o: &OverallStat) -> serde_json::Value {
    serde_json::json!({
        "totalClasses": o.total_classes,
        "presentClasses": o.present_classes,
        "absentClasses": o.absent_classes(),
        "percentage": o.percentage,
        "activeSubjects": o.active_subjects,
        "band": o.band.as_str(),
        "lowAttendance": o.low_attendance,
    })
}
