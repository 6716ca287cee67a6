use std::collections::BTreeMap;
use std::fmt;

/// Letter grades used on score rows and term summaries. The thresholds are
/// fixed percentage breakpoints; `rank_weight` is only used for distribution
/// tallies, ordering always uses the numeric average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn from_score(score: f64, max_score: f64) -> Grade {
        let percentage = if max_score > 0.0 {
            score / max_score * 100.0
        } else {
            0.0
        };
        Grade::from_percentage(percentage)
    }

    pub fn from_percentage(percentage: f64) -> Grade {
        if percentage >= 90.0 {
            Grade::A
        } else if percentage >= 80.0 {
            Grade::B
        } else if percentage >= 70.0 {
            Grade::C
        } else if percentage >= 60.0 {
            Grade::D
        } else {
            Grade::F
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }

    #[allow(dead_code)]
    pub fn rank_weight(self) -> i64 {
        match self {
            Grade::A => 5,
            Grade::B => 4,
            Grade::C => 3,
            Grade::D => 2,
            Grade::F => 1,
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn parse(raw: &str) -> Option<AttendanceStatus> {
        match raw {
            "PRESENT" => Some(AttendanceStatus::Present),
            "ABSENT" => Some(AttendanceStatus::Absent),
            "LATE" => Some(AttendanceStatus::Late),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Late => "LATE",
        }
    }
}

/// Academic sub-period. Scores group on (term, year).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    First,
    Second,
    Third,
}

impl Term {
    pub fn parse(raw: &str) -> Option<Term> {
        match raw {
            "FIRST" => Some(Term::First),
            "SECOND" => Some(Term::Second),
            "THIRD" => Some(Term::Third),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Term::First => "FIRST",
            Term::Second => "SECOND",
            Term::Third => "THIRD",
        }
    }
}

/// One-decimal display formatting, matching the API surface ("78.3", "90.0").
pub fn fixed1(x: f64) -> String {
    format!("{:.1}", x)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttendanceTally {
    pub total_days: i64,
    pub present_days: i64,
    pub absent_days: i64,
    pub late_days: i64,
}

impl AttendanceTally {
    pub fn add(&mut self, status: AttendanceStatus) {
        self.total_days += 1;
        match status {
            AttendanceStatus::Present => self.present_days += 1,
            AttendanceStatus::Absent => self.absent_days += 1,
            AttendanceStatus::Late => self.late_days += 1,
        }
    }

    pub fn merge(&mut self, other: AttendanceTally) {
        self.total_days += other.total_days;
        self.present_days += other.present_days;
        self.absent_days += other.absent_days;
        self.late_days += other.late_days;
    }

    /// LATE counts toward the present-equivalent numerator but is reported
    /// separately. Zero marks yields 0.0, never NaN.
    pub fn percentage(&self) -> f64 {
        if self.total_days > 0 {
            (self.present_days + self.late_days) as f64 / self.total_days as f64 * 100.0
        } else {
            0.0
        }
    }

    /// "90.0%" when any marks exist, "0%" for an empty range.
    pub fn percentage_display(&self) -> String {
        if self.total_days > 0 {
            format!("{}%", fixed1(self.percentage()))
        } else {
            "0%".to_string()
        }
    }
}

pub fn tally_statuses<I>(statuses: I) -> AttendanceTally
where
    I: IntoIterator<Item = AttendanceStatus>,
{
    let mut tally = AttendanceTally::default();
    for s in statuses {
        tally.add(s);
    }
    tally
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreTotals {
    pub subject_count: i64,
    pub total_score: f64,
    pub total_max_score: f64,
}

impl ScoreTotals {
    pub fn add(&mut self, score: f64, max_score: f64) {
        self.subject_count += 1;
        self.total_score += score;
        self.total_max_score += max_score;
    }

    /// Pooled percentage across all subjects; 0 when nothing is scored.
    pub fn average(&self) -> f64 {
        if self.total_max_score > 0.0 {
            self.total_score / self.total_max_score * 100.0
        } else {
            0.0
        }
    }

    pub fn overall_grade(&self) -> Grade {
        Grade::from_percentage(self.average())
    }
}

/// One student's aggregate entering the ranking. `average` is the pooled
/// percentage from `ScoreTotals::average`, not a mean of letter grades.
#[derive(Debug, Clone)]
pub struct StudentStanding {
    pub student_id: String,
    pub average: f64,
    pub overall_grade: Grade,
}

#[derive(Debug, Clone, Default)]
pub struct ClassStandings {
    /// Sorted by average descending; position = index + 1. Equal averages
    /// keep their input order and receive distinct consecutive positions.
    pub ranked: Vec<StudentStanding>,
    pub class_average: f64,
    pub highest_score: f64,
    pub lowest_score: f64,
    pub grade_distribution: BTreeMap<&'static str, i64>,
}

impl ClassStandings {
    pub fn position_of(&self, student_id: &str) -> Option<usize> {
        self.ranked
            .iter()
            .position(|s| s.student_id == student_id)
            .map(|i| i + 1)
    }
}

/// Orders a cohort by average descending and computes cohort statistics.
/// An empty cohort degrades to a zero-valued summary rather than an error.
pub fn rank_standings(mut rows: Vec<StudentStanding>) -> ClassStandings {
    rows.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let class_average = if rows.is_empty() {
        0.0
    } else {
        rows.iter().map(|s| s.average).sum::<f64>() / rows.len() as f64
    };
    let highest_score = rows.first().map(|s| s.average).unwrap_or(0.0);
    let lowest_score = rows.last().map(|s| s.average).unwrap_or(0.0);

    let mut grade_distribution: BTreeMap<&'static str, i64> = BTreeMap::new();
    for s in &rows {
        *grade_distribution.entry(s.overall_grade.as_str()).or_insert(0) += 1;
    }

    ClassStandings {
        ranked: rows,
        class_average,
        highest_score,
        lowest_score,
        grade_distribution,
    }
}

/// Ordinal suffix with the 11th/12th/13th exception band.
pub fn position_suffix(position: usize) -> String {
    if position % 10 == 1 && position % 100 != 11 {
        format!("{}st", position)
    } else if position % 10 == 2 && position % 100 != 12 {
        format!("{}nd", position)
    } else if position % 10 == 3 && position % 100 != 13 {
        format!("{}rd", position)
    } else {
        format!("{}th", position)
    }
}

pub fn academic_remarks(average: f64) -> &'static str {
    if average >= 90.0 {
        "Excellent performance! Keep up the outstanding work."
    } else if average >= 80.0 {
        "Very good performance. Continue working hard."
    } else if average >= 70.0 {
        "Good performance. There is room for improvement."
    } else if average >= 60.0 {
        "Satisfactory performance. More effort needed."
    } else {
        "Needs significant improvement. Please seek additional support."
    }
}

pub fn attendance_remarks(attendance_percentage: f64) -> &'static str {
    if attendance_percentage >= 95.0 {
        "Excellent attendance record."
    } else if attendance_percentage >= 85.0 {
        "Good attendance record."
    } else if attendance_percentage >= 75.0 {
        "Satisfactory attendance. Improvement needed."
    } else {
        "Poor attendance. This affects academic performance."
    }
}

pub fn general_remarks(average: f64, attendance_percentage: f64) -> &'static str {
    if average >= 80.0 && attendance_percentage >= 90.0 {
        "Excellent student with strong academic performance and attendance."
    } else if average >= 70.0 && attendance_percentage >= 80.0 {
        "Good student showing consistent effort and attendance."
    } else if average < 60.0 || attendance_percentage < 75.0 {
        "Student needs additional support and improved attendance."
    } else {
        "Student showing steady progress. Continue encouraging effort."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_boundaries_map_exactly() {
        assert_eq!(Grade::from_score(90.0, 100.0), Grade::A);
        assert_eq!(Grade::from_score(89.999, 100.0), Grade::B);
        assert_eq!(Grade::from_score(80.0, 100.0), Grade::B);
        assert_eq!(Grade::from_score(70.0, 100.0), Grade::C);
        assert_eq!(Grade::from_score(60.0, 100.0), Grade::D);
        assert_eq!(Grade::from_score(59.999, 100.0), Grade::F);
        assert_eq!(Grade::from_score(45.0, 50.0), Grade::A);
    }

    #[test]
    fn grade_is_monotone_in_score() {
        let mut last = Grade::A.rank_weight();
        for score in (0..=100).rev() {
            let w = Grade::from_score(score as f64, 100.0).rank_weight();
            assert!(w <= last, "grade weight rose as score fell at {}", score);
            last = w;
        }
    }

    #[test]
    fn rank_weights() {
        assert_eq!(Grade::A.rank_weight(), 5);
        assert_eq!(Grade::B.rank_weight(), 4);
        assert_eq!(Grade::C.rank_weight(), 3);
        assert_eq!(Grade::D.rank_weight(), 2);
        assert_eq!(Grade::F.rank_weight(), 1);
    }

    #[test]
    fn empty_tally_is_zero_percent_not_nan() {
        let tally = AttendanceTally::default();
        assert_eq!(tally.percentage(), 0.0);
        assert_eq!(tally.percentage_display(), "0%");
    }

    #[test]
    fn late_counts_toward_percentage_but_not_present() {
        let statuses = std::iter::repeat(AttendanceStatus::Present)
            .take(7)
            .chain(std::iter::repeat(AttendanceStatus::Late).take(2))
            .chain(std::iter::once(AttendanceStatus::Absent));
        let tally = tally_statuses(statuses);
        assert_eq!(tally.total_days, 10);
        assert_eq!(tally.present_days, 7);
        assert_eq!(tally.late_days, 2);
        assert_eq!(tally.absent_days, 1);
        assert_eq!(tally.percentage_display(), "90.0%");
    }

    #[test]
    fn score_totals_guard_zero_max() {
        let totals = ScoreTotals::default();
        assert_eq!(totals.average(), 0.0);
        assert_eq!(totals.overall_grade(), Grade::F);
    }

    #[test]
    fn overall_grade_pools_scores_rather_than_averaging_letters() {
        let mut totals = ScoreTotals::default();
        totals.add(95.0, 100.0);
        totals.add(40.0, 50.0);
        assert!((totals.average() - 90.0).abs() < 1e-9);
        assert_eq!(totals.overall_grade(), Grade::A);
    }

    fn standing(id: &str, average: f64) -> StudentStanding {
        StudentStanding {
            student_id: id.to_string(),
            average,
            overall_grade: Grade::from_percentage(average),
        }
    }

    #[test]
    fn positions_form_permutation_for_distinct_averages() {
        let standings = rank_standings(vec![
            standing("s-low", 58.0),
            standing("s-high", 95.0),
            standing("s-mid", 82.0),
        ]);
        let order: Vec<&str> = standings
            .ranked
            .iter()
            .map(|s| s.student_id.as_str())
            .collect();
        assert_eq!(order, vec!["s-high", "s-mid", "s-low"]);
        assert_eq!(standings.position_of("s-high"), Some(1));
        assert_eq!(standings.position_of("s-mid"), Some(2));
        assert_eq!(standings.position_of("s-low"), Some(3));
    }

    #[test]
    fn equal_averages_keep_input_order_without_collapsing() {
        let standings = rank_standings(vec![
            standing("first-90", 90.0),
            standing("second-90", 90.0),
            standing("seventy", 70.0),
            standing("fifty", 50.0),
        ]);
        assert_eq!(standings.position_of("first-90"), Some(1));
        assert_eq!(standings.position_of("second-90"), Some(2));
        assert_eq!(standings.position_of("seventy"), Some(3));
        assert_eq!(standings.position_of("fifty"), Some(4));
    }

    #[test]
    fn class_statistics_for_three_students() {
        let standings = rank_standings(vec![
            standing("s1", 95.0),
            standing("s2", 82.0),
            standing("s3", 58.0),
        ]);
        assert_eq!(fixed1(standings.class_average), "78.3");
        assert_eq!(standings.highest_score, 95.0);
        assert_eq!(standings.lowest_score, 58.0);
        assert_eq!(standings.grade_distribution.get("A"), Some(&1));
        assert_eq!(standings.grade_distribution.get("B"), Some(&1));
        assert_eq!(standings.grade_distribution.get("F"), Some(&1));
        assert_eq!(standings.grade_distribution.len(), 3);
    }

    #[test]
    fn empty_cohort_degrades_to_zero_summary() {
        let standings = rank_standings(Vec::new());
        assert!(standings.ranked.is_empty());
        assert_eq!(standings.class_average, 0.0);
        assert_eq!(standings.highest_score, 0.0);
        assert_eq!(standings.lowest_score, 0.0);
        assert!(standings.grade_distribution.is_empty());
    }

    #[test]
    fn position_suffix_handles_teens() {
        assert_eq!(position_suffix(1), "1st");
        assert_eq!(position_suffix(2), "2nd");
        assert_eq!(position_suffix(3), "3rd");
        assert_eq!(position_suffix(4), "4th");
        assert_eq!(position_suffix(11), "11th");
        assert_eq!(position_suffix(12), "12th");
        assert_eq!(position_suffix(13), "13th");
        assert_eq!(position_suffix(21), "21st");
        assert_eq!(position_suffix(22), "22nd");
        assert_eq!(position_suffix(23), "23rd");
        assert_eq!(position_suffix(111), "111th");
    }

    #[test]
    fn general_remarks_selects_single_band() {
        assert_eq!(
            general_remarks(85.0, 92.0),
            "Excellent student with strong academic performance and attendance."
        );
        assert_eq!(
            general_remarks(85.0, 85.0),
            "Good student showing consistent effort and attendance."
        );
        assert_eq!(
            general_remarks(55.0, 95.0),
            "Student needs additional support and improved attendance."
        );
        assert_eq!(
            general_remarks(65.0, 78.0),
            "Student showing steady progress. Continue encouraging effort."
        );
    }

    #[test]
    fn academic_and_attendance_remark_bands() {
        assert_eq!(
            academic_remarks(90.0),
            "Excellent performance! Keep up the outstanding work."
        );
        assert_eq!(
            academic_remarks(89.9),
            "Very good performance. Continue working hard."
        );
        assert_eq!(
            academic_remarks(70.0),
            "Good performance. There is room for improvement."
        );
        assert_eq!(
            academic_remarks(60.0),
            "Satisfactory performance. More effort needed."
        );
        assert_eq!(
            academic_remarks(59.9),
            "Needs significant improvement. Please seek additional support."
        );
        assert_eq!(attendance_remarks(95.0), "Excellent attendance record.");
        assert_eq!(attendance_remarks(94.9), "Good attendance record.");
        assert_eq!(
            attendance_remarks(75.0),
            "Satisfactory attendance. Improvement needed."
        );
        assert_eq!(
            attendance_remarks(74.9),
            "Poor attendance. This affects academic performance."
        );
    }
}
