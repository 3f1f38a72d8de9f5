use async_trait::async_trait;
use tracing::{debug, instrument};
use url::Url;

use crate::api::{FetchError, PromotedEntity, PromotedResponse};
use crate::utils::endpoint_url;

#[async_trait]
pub trait PromotedEntitySource: Send + Sync {
    async fn promoted_entities(&self, page_location: &str)
        -> Result<Vec<PromotedEntity>, FetchError>;
}

/// Reads promoted entities from `GET {api_base}/promoted?placement={page_location}`.
pub struct HttpFetcher {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, api_base: &Url) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            endpoint: endpoint_url(api_base, "promoted")?,
        })
    }
}

#[async_trait]
impl PromotedEntitySource for HttpFetcher {
    #[instrument(skip_all, fields(page_location))]
    async fn promoted_entities(
        &self,
        page_location: &str,
    ) -> Result<Vec<PromotedEntity>, FetchError> {
        tracing::Span::current().record("page_location", page_location);

        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("placement", page_location)])
            .send()
            .await?
            .error_for_status()?;

        let body = response.bytes().await?;
        let entities = serde_json::from_slice::<PromotedResponse>(&body)?.entities();

        debug!(count = entities.len(), "fetched promoted entities");
        Ok(entities)
    }
}

/// Serves the same entities for every page location. Used for local runs without
/// a backend.
#[derive(Clone, Default)]
pub struct StaticSource {
    entities: Vec<PromotedEntity>,
}

impl StaticSource {
    pub fn new(entities: Vec<PromotedEntity>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl PromotedEntitySource for StaticSource {
    async fn promoted_entities(
        &self,
        _page_location: &str,
    ) -> Result<Vec<PromotedEntity>, FetchError> {
        Ok(self.entities.clone())
    }
}
