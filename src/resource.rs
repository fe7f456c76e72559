use async_trait::async_trait;
use serde::Serialize;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    User,
    Course,
}

impl ResourceType {
    pub fn id(self) -> &'static str {
        match self {
            ResourceType::User => "user",
            ResourceType::Course => "course",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId {
    pub resource_type: ResourceType,
    pub resource: String,
}

impl ResourceId {
    pub fn new(resource_type: ResourceType, resource: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub login_id: String,
    pub display_name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserTrait {
    pub email: String,
    pub status: UserStatus,
    pub profile: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ResourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserTrait>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub id: String,
    pub resource: ResourceId,
    pub slug: String,
    pub display_name: String,
    pub description: String,
    pub grantable_to: Vec<ResourceType>,
}

impl Entitlement {
    pub fn entitlement_id(resource: &ResourceId, slug: &str) -> String {
        format!("{}:{}:{}", resource.resource_type.id(), resource.resource, slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub id: String,
    pub entitlement_id: String,
    pub resource: ResourceId,
    pub slug: String,
    pub principal: ResourceId,
}

impl Grant {
    pub fn new(resource: &ResourceId, slug: &str, principal: ResourceId) -> Self {
        let entitlement_id = Entitlement::entitlement_id(resource, slug);
        Self {
            id: format!(
                "{}:{}:{}",
                entitlement_id,
                principal.resource_type.id(),
                principal.resource
            ),
            entitlement_id,
            resource: resource.clone(),
            slug: slug.to_string(),
            principal,
        }
    }
}

/// One page of results. The report is a single bulk payload, so the token
/// is always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: String,
}

impl<T> Page<T> {
    pub fn single(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: String::new(),
        }
    }
}

/// Per-resource-type view the host drives during a sync.
#[async_trait]
pub trait ResourceSyncer: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    async fn list(&self, parent: Option<&ResourceId>) -> Result<Page<Resource>, SyncError>;

    async fn entitlements(&self, resource: &Resource) -> Result<Page<Entitlement>, SyncError>;

    async fn grants(&self, resource: &Resource) -> Result<Page<Grant>, SyncError>;
}
