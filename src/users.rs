use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::models::{ReportRow, User};
use crate::resource::{
    Entitlement, Grant, Page, Resource, ResourceId, ResourceSyncer, ResourceType, UserProfile,
    UserStatus, UserTrait,
};
use crate::sync::ReportSync;

/// Display name used when a user row carries no identifying fields at all.
pub const NO_NAME: &str = "<no name>";

/// Completed date, else last access, else first access. ISO-8601 strings
/// order correctly as plain strings.
pub fn recency_key(row: &ReportRow) -> &str {
    [&row.completed_date, &row.last_access, &row.first_access]
        .into_iter()
        .filter_map(|date| date.as_deref())
        .find(|date| !date.is_empty())
        .unwrap_or("")
}

/// One user per user id. A later row replaces the candidate only when its
/// recency key is strictly greater. Output order is unspecified.
pub fn extract_users(rows: &[ReportRow]) -> Vec<User> {
    let mut candidates: HashMap<&str, (User, &str)> = HashMap::new();

    for row in rows {
        if row.user_id.is_empty() {
            continue;
        }

        let key = recency_key(row);
        match candidates.get_mut(row.user_id.as_str()) {
            Some((user, newest)) => {
                if key > *newest {
                    debug!(
                        user_id = %row.user_id,
                        old_date = %newest,
                        new_date = %key,
                        "updating user with more recent data"
                    );
                    *user = User::from(row);
                    *newest = key;
                }
            }
            None => {
                candidates.insert(&row.user_id, (User::from(row), key));
            }
        }
    }

    candidates.into_values().map(|(user, _)| user).collect()
}

pub fn display_name(user: &User) -> String {
    let full_name = format!("{} {}", user.first_name, user.last_name);
    let full_name = full_name.trim();
    if !full_name.is_empty() {
        full_name.to_string()
    } else if !user.email.is_empty() {
        user.email.clone()
    } else if !user.id.is_empty() {
        user.id.clone()
    } else {
        NO_NAME.to_string()
    }
}

pub fn user_resource(user: &User, parent: Option<&ResourceId>) -> Resource {
    let name = display_name(user);
    Resource {
        id: ResourceId::new(ResourceType::User, user.id.clone()),
        display_name: name.clone(),
        parent: parent.cloned(),
        user: Some(UserTrait {
            email: user.email.clone(),
            status: UserStatus::Enabled,
            profile: UserProfile {
                id: user.id.clone(),
                login_id: user.id.clone(),
                display_name: name,
                email: user.email.clone(),
                first_name: user.first_name.clone(),
                last_name: user.last_name.clone(),
            },
        }),
    }
}

pub struct UserSyncer {
    sync: Arc<ReportSync>,
}

impl UserSyncer {
    pub fn new(sync: Arc<ReportSync>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ResourceSyncer for UserSyncer {
    fn resource_type(&self) -> ResourceType {
        ResourceType::User
    }

    async fn list(&self, parent: Option<&ResourceId>) -> Result<Page<Resource>, SyncError> {
        let report = self.sync.wait_for_report().await?;
        if report.rows.is_empty() {
            warn!("no report data available");
            return Ok(Page::single(Vec::new()));
        }

        let users = extract_users(&report.rows);
        let resources: Vec<Resource> = users
            .iter()
            .map(|user| user_resource(user, parent))
            .collect();

        let total = report.rows.len();
        let duplicates = total - resources.len();
        info!(
            total_report_entries = total,
            unique_users = resources.len(),
            duplicate_entries = duplicates,
            deduplication_ratio = duplicates as f64 / total as f64,
            "user extraction completed"
        );

        Ok(Page::single(resources))
    }

    async fn entitlements(&self, _resource: &Resource) -> Result<Page<Entitlement>, SyncError> {
        Ok(Page::single(Vec::new()))
    }

    async fn grants(&self, _resource: &Resource) -> Result<Page<Grant>, SyncError> {
        Ok(Page::single(Vec::new()))
    }
}
