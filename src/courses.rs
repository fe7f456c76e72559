use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::models::{Course, NormalizedStatus, ReportRow};
use crate::resource::{Entitlement, Grant, Page, Resource, ResourceId, ResourceSyncer, ResourceType};
use crate::sync::ReportSync;

/// Pseudo-status granted alongside the normalized status vocabulary.
pub const ASSIGNED_ENTITLEMENT: &str = "assigned";

#[derive(Debug, Default)]
pub struct CourseExtraction {
    pub courses: Vec<Course>,
    pub skipped: usize,
}

pub fn course_title(row: &ReportRow) -> String {
    if row.content_title.is_empty() {
        row.content_id.clone()
    } else if row.content_type.is_empty() {
        row.content_title.clone()
    } else {
        format!("{} ({})", row.content_title, row.content_type)
    }
}

/// One course per content id; the first row seen fixes the title.
pub fn extract_courses(rows: &[ReportRow]) -> CourseExtraction {
    let mut courses: HashMap<&str, Course> = HashMap::new();
    let mut skipped = 0usize;

    for row in rows {
        if row.content_id.is_empty() {
            skipped += 1;
            continue;
        }
        courses.entry(&row.content_id).or_insert_with(|| Course {
            id: row.content_id.clone(),
            title: course_title(row),
        });
    }

    CourseExtraction {
        courses: courses.into_values().collect(),
        skipped,
    }
}

pub fn course_resource(course: &Course, parent: Option<&ResourceId>) -> Resource {
    Resource {
        id: ResourceId::new(ResourceType::Course, course.id.clone()),
        display_name: course.title.clone(),
        parent: parent.cloned(),
        user: None,
    }
}

fn entitlement_slugs() -> impl Iterator<Item = &'static str> {
    std::iter::once(ASSIGNED_ENTITLEMENT)
        .chain(NormalizedStatus::ALL.into_iter().map(NormalizedStatus::as_str))
}

fn entitlement_description(slug: &str, course_name: &str) -> String {
    match slug {
        ASSIGNED_ENTITLEMENT => format!("Assigned course {course_name} in Percipio"),
        "completed" => format!("Completed course {course_name} in Percipio"),
        "in_progress" => format!("In progress course {course_name} in Percipio"),
        "no_status_reported" => format!("No status reported for course {course_name} in Percipio"),
        _ => format!("Status undefined for course {course_name} in Percipio"),
    }
}

/// The fixed entitlement set every course exposes.
pub fn course_entitlements(resource: &Resource) -> Vec<Entitlement> {
    entitlement_slugs()
        .map(|slug| Entitlement {
            id: Entitlement::entitlement_id(&resource.id, slug),
            resource: resource.id.clone(),
            slug: slug.to_string(),
            display_name: format!("Course {} {}", resource.display_name, slug),
            description: entitlement_description(slug, &resource.display_name),
            grantable_to: vec![ResourceType::User],
        })
        .collect()
}

pub struct CourseSyncer {
    sync: Arc<ReportSync>,
}

impl CourseSyncer {
    pub fn new(sync: Arc<ReportSync>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ResourceSyncer for CourseSyncer {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Course
    }

    async fn list(&self, parent: Option<&ResourceId>) -> Result<Page<Resource>, SyncError> {
        let report = self.sync.wait_for_report().await?;
        if report.rows.is_empty() {
            warn!("no report data available");
            return Ok(Page::single(Vec::new()));
        }

        let extraction = extract_courses(&report.rows);
        if extraction.skipped > 0 {
            warn!(skipped = extraction.skipped, "report entries without a content id");
        }

        let resources: Vec<Resource> = extraction
            .courses
            .iter()
            .map(|course| course_resource(course, parent))
            .collect();

        let total = report.rows.len();
        let duplicates = total - extraction.skipped - resources.len();
        info!(
            total_report_entries = total,
            unique_courses = resources.len(),
            duplicate_entries = duplicates,
            skipped = extraction.skipped,
            deduplication_ratio = duplicates as f64 / total as f64,
            "course extraction completed"
        );

        Ok(Page::single(resources))
    }

    async fn entitlements(&self, resource: &Resource) -> Result<Page<Entitlement>, SyncError> {
        Ok(Page::single(course_entitlements(resource)))
    }

    async fn grants(&self, resource: &Resource) -> Result<Page<Grant>, SyncError> {
        let report = self.sync.wait_for_report().await?;
        let Some(statuses) = report.statuses.lookup(&resource.id.resource) else {
            return Ok(Page::single(Vec::new()));
        };

        // Rows without a user id never become user resources.
        let mut distribution: BTreeMap<NormalizedStatus, usize> = BTreeMap::new();
        let grants: Vec<Grant> = statuses
            .iter()
            .filter(|(user_id, _)| !user_id.is_empty())
            .map(|(user_id, status)| {
                *distribution.entry(*status).or_insert(0) += 1;
                Grant::new(
                    &resource.id,
                    status.as_str(),
                    ResourceId::new(ResourceType::User, user_id.clone()),
                )
            })
            .collect();

        debug!(
            course_id = %resource.id.resource,
            course_name = %resource.display_name,
            total_grants = grants.len(),
            status_distribution = ?distribution,
            "grants created for course"
        );

        Ok(Page::single(grants))
    }
}
