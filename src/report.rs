use std::collections::HashMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::resource::{Entitlement, Grant, Resource, ResourceSyncer, ResourceType};

/// Everything one run handed to the host, in stable order.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSnapshot {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub resources: Vec<Resource>,
    pub entitlements: Vec<Entitlement>,
    pub grants: Vec<Grant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSummary {
    pub status: String,
    pub count: usize,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseActivity {
    pub course_id: String,
    pub course_name: String,
    pub grant_count: usize,
}

#[derive(Debug, Serialize)]
struct GrantRow<'a> {
    course_id: &'a str,
    course_name: &'a str,
    user_id: &'a str,
    status: &'a str,
}

/// Walks every syncer the way the host would: list, then entitlements and
/// grants per resource. Resources listed under another syncer's type are
/// dropped.
pub async fn collect_snapshot(
    run_id: Uuid,
    syncers: &[Box<dyn ResourceSyncer>],
) -> Result<SyncSnapshot, SyncError> {
    let mut resources = Vec::new();
    let mut entitlements = Vec::new();
    let mut grants = Vec::new();

    for syncer in syncers {
        let resource_type = syncer.resource_type();
        let page = syncer.list(None).await?;
        let listed = page.items.len();
        let items: Vec<Resource> = page
            .items
            .into_iter()
            .filter(|r| r.id.resource_type == resource_type)
            .collect();
        if items.len() < listed {
            warn!(
                resource_type = resource_type.id(),
                dropped = listed - items.len(),
                "syncer listed resources of another type"
            );
        }

        for resource in &items {
            entitlements.extend(syncer.entitlements(resource).await?.items);
            grants.extend(syncer.grants(resource).await?.items);
        }
        debug!(
            resource_type = resource_type.id(),
            resources = items.len(),
            "resource type synced"
        );
        resources.extend(items);
    }

    resources.sort_by(|a, b| a.id.cmp(&b.id));
    entitlements.sort_by(|a, b| a.id.cmp(&b.id));
    grants.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(SyncSnapshot {
        run_id,
        generated_at: Utc::now(),
        resources,
        entitlements,
        grants,
    })
}

fn count_resources(snapshot: &SyncSnapshot, resource_type: ResourceType) -> usize {
    snapshot
        .resources
        .iter()
        .filter(|r| r.id.resource_type == resource_type)
        .count()
}

pub fn summarize_by_status(grants: &[Grant]) -> Vec<StatusSummary> {
    let mut map: HashMap<&str, usize> = HashMap::new();
    for grant in grants {
        *map.entry(grant.slug.as_str()).or_insert(0) += 1;
    }

    let total = grants.len();
    let mut summaries: Vec<StatusSummary> = map
        .into_iter()
        .map(|(status, count)| StatusSummary {
            status: status.to_string(),
            count,
            share: if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.status.cmp(&b.status)));
    summaries
}

fn course_names(snapshot: &SyncSnapshot) -> HashMap<&str, &str> {
    snapshot
        .resources
        .iter()
        .filter(|r| r.id.resource_type == ResourceType::Course)
        .map(|r| (r.id.resource.as_str(), r.display_name.as_str()))
        .collect()
}

pub fn most_active_courses(snapshot: &SyncSnapshot) -> Vec<CourseActivity> {
    let names = course_names(snapshot);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for grant in &snapshot.grants {
        *counts.entry(grant.resource.resource.as_str()).or_insert(0) += 1;
    }

    let mut activity: Vec<CourseActivity> = counts
        .into_iter()
        .map(|(course_id, grant_count)| CourseActivity {
            course_id: course_id.to_string(),
            course_name: names.get(course_id).copied().unwrap_or(course_id).to_string(),
            grant_count,
        })
        .collect();

    activity.sort_by(|a, b| {
        b.grant_count
            .cmp(&a.grant_count)
            .then_with(|| a.course_id.cmp(&b.course_id))
    });
    activity
}

pub fn build_report(snapshot: &SyncSnapshot) -> String {
    let summaries = summarize_by_status(&snapshot.grants);
    let activity = most_active_courses(snapshot);

    let mut output = String::new();

    let _ = writeln!(output, "# Learning Activity Sync Report");
    let _ = writeln!(
        output,
        "Run {} generated at {}",
        snapshot.run_id,
        snapshot.generated_at.to_rfc3339()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Totals");
    let _ = writeln!(output, "- Users: {}", count_resources(snapshot, ResourceType::User));
    let _ = writeln!(
        output,
        "- Courses: {}",
        count_resources(snapshot, ResourceType::Course)
    );
    let _ = writeln!(output, "- Entitlements: {}", snapshot.entitlements.len());
    let _ = writeln!(output, "- Grants: {}", snapshot.grants.len());

    let _ = writeln!(output);
    let _ = writeln!(output, "## Status Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No grants recorded for this run.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} grants ({:.1}%)",
                summary.status,
                summary.count,
                summary.share * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Most Active Courses");

    if activity.is_empty() {
        let _ = writeln!(output, "No course activity recorded for this run.");
    } else {
        for course in activity.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}): {} grants",
                course.course_name, course.course_id, course.grant_count
            );
        }
    }

    output
}

/// Writes one CSV row per grant and returns the number written.
pub fn write_grants_csv<W: std::io::Write>(
    snapshot: &SyncSnapshot,
    writer: W,
) -> anyhow::Result<usize> {
    let names = course_names(snapshot);
    let mut csv_writer = csv::Writer::from_writer(writer);
    let mut written = 0usize;

    for grant in &snapshot.grants {
        let course_id = grant.resource.resource.as_str();
        csv_writer.serialize(GrantRow {
            course_id,
            course_name: names.get(course_id).copied().unwrap_or(course_id),
            user_id: &grant.principal.resource,
            status: &grant.slug,
        })?;
        written += 1;
    }

    csv_writer.flush()?;
    Ok(written)
}
