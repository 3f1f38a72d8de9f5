use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marketplace section a promoted entity belongs to. Decides the detail route when
/// the backend does not hand us an explicit link.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Vehicle,
    Job,
    Supplier,
}

impl EntityKind {
    pub fn route_prefix(&self) -> &'static str {
        match self {
            EntityKind::Vehicle => "/vehicles",
            EntityKind::Job => "/jobs",
            EntityKind::Supplier => "/suppliers",
        }
    }
}

/// Everything needed to render one promoted slot. Fetched fresh on every mount.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PromotedEntity {
    #[serde(alias = "_id", alias = "entity_id")]
    pub id: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl PromotedEntity {
    /// Where a click on this slot takes the user.
    pub fn detail_path(&self) -> String {
        match &self.link {
            Some(link) if !link.is_empty() => link.clone(),
            _ => format!("{}/{}", self.kind.route_prefix(), self.id),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum PromotedResponse {
    /// `{"entities": [...]}`
    Wrapped { entities: Vec<PromotedEntity> },
    /// A bare list of entities
    Bare(Vec<PromotedEntity>),
}

impl PromotedResponse {
    pub fn entities(self) -> Vec<PromotedEntity> {
        match self {
            PromotedResponse::Wrapped { entities } => entities,
            PromotedResponse::Bare(entities) => entities,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ImpressionEvent {
    pub entity_id: String,
    pub page_location: String,
    pub session_id: String,
    pub referrer: Option<String>,
    pub timestamp: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ClickEvent {
    pub entity_id: String,
    pub page_location: String,
    pub session_id: String,
    pub timestamp: String,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid promoted entities url: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("failed to fetch promoted entities: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("failed to decode promoted entities: {0}")]
    DecodingError(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("invalid attribution url: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("attribution event could not be delivered: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("attribution endpoint unavailable: {0}")]
    Unavailable(String),
}
