use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info};

use crate::models::{NormalizedStatus, ReportRow};

/// Course id -> user id -> normalized status, e.g.
///
/// ```text
/// {
///   "course-1": { "user-1": in_progress, "user-2": completed },
/// }
/// ```
///
/// Built once per report and read-only afterwards. For a repeated
/// (course, user) pair the last row in report order wins.
#[derive(Debug, Default)]
pub struct StatusStore {
    courses: HashMap<String, HashMap<String, NormalizedStatus>>,
}

impl StatusStore {
    pub fn build(rows: &[ReportRow]) -> Self {
        let started = Instant::now();
        debug!(report_entries = rows.len(), "building status store from report");

        let mut courses: HashMap<String, HashMap<String, NormalizedStatus>> = HashMap::new();
        let mut unique_users: HashSet<&str> = HashSet::new();
        let mut distribution: BTreeMap<NormalizedStatus, usize> = BTreeMap::new();

        for row in rows {
            let status = NormalizedStatus::from_upstream(&row.status);
            courses
                .entry(row.content_id.clone())
                .or_default()
                .insert(row.user_id.clone(), status);
            unique_users.insert(&row.user_id);
            *distribution.entry(status).or_insert(0) += 1;
        }

        info!(
            total_entries = rows.len(),
            unique_courses = courses.len(),
            unique_users = unique_users.len(),
            status_distribution = ?distribution,
            duration_ms = started.elapsed().as_millis() as u64,
            "status store loaded"
        );

        Self { courses }
    }

    /// Statuses by user for a course; `None` when the course never appeared.
    pub fn lookup(&self, content_id: &str) -> Option<&HashMap<String, NormalizedStatus>> {
        self.courses.get(content_id)
    }

    pub fn course_count(&self) -> usize {
        self.courses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, content: &str, status: &str) -> ReportRow {
        ReportRow {
            user_id: user.to_string(),
            content_id: content.to_string(),
            status: status.to_string(),
            ..ReportRow::default()
        }
    }

    #[test]
    fn last_row_wins_over_stronger_status() {
        let store = StatusStore::build(&[row("a", "c1", "Completed"), row("a", "c1", "Started")]);
        let statuses = store.lookup("c1").unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["a"], NormalizedStatus::InProgress);
    }

    #[test]
    fn groups_users_by_course() {
        let store = StatusStore::build(&[
            row("user1", "course1", "Completed"),
            row("user2", "course1", "Active"),
            row("user1", "course2", ""),
            row("user3", "course2", "Expired"),
        ]);

        assert_eq!(store.course_count(), 2);
        let course1 = store.lookup("course1").unwrap();
        assert_eq!(course1["user1"], NormalizedStatus::Completed);
        assert_eq!(course1["user2"], NormalizedStatus::InProgress);
        let course2 = store.lookup("course2").unwrap();
        assert_eq!(course2["user1"], NormalizedStatus::NoStatusReported);
        assert_eq!(course2["user3"], NormalizedStatus::StatusUndefined);
    }

    #[test]
    fn unknown_course_has_no_statuses() {
        let store = StatusStore::build(&[row("user1", "course1", "Watched")]);
        assert!(store.lookup("missing").is_none());
        assert!(StatusStore::default().lookup("course1").is_none());
    }

    #[test]
    fn interleaved_pairs_keep_their_own_last_value() {
        let store = StatusStore::build(&[
            row("a", "c1", "Started"),
            row("b", "c1", "Completed"),
            row("a", "c1", "Achieved"),
            row("b", "c1", "Bogus"),
        ]);
        let statuses = store.lookup("c1").unwrap();
        assert_eq!(statuses["a"], NormalizedStatus::Completed);
        assert_eq!(statuses["b"], NormalizedStatus::StatusUndefined);
    }
}
