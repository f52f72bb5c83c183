//! Upstream catalog contracts + the vPIC HTTP and fixture-file sources.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use vpic_core::{RawRecord, WorkKey};
use vpic_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vpic-adapters";

pub const DEFAULT_BASE_URL: &str = "https://vpic.nhtsa.dot.gov/api";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {}: {source}", path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing payload from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `{"Count": .., "Message": .., "Results": [..]}` as served by the vPIC API.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsEnvelope {
    #[serde(rename = "Count", default)]
    pub count: Option<u64>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "Results", default)]
    pub results: Vec<JsonValue>,
}

/// One upstream listing: the records plus the payload they came from.
#[derive(Debug, Clone)]
pub struct Listing {
    pub records: Vec<RawRecord>,
    pub payload: JsonValue,
}

impl Listing {
    pub fn from_payload(origin: &str, payload: JsonValue) -> Result<Self, SourceError> {
        let envelope: ResultsEnvelope =
            serde_json::from_value(payload.clone()).map_err(|source| SourceError::Parse {
                origin: origin.to_string(),
                source,
            })?;
        if let Some(count) = envelope.count {
            if count as usize != envelope.results.len() {
                warn!(
                    origin,
                    count,
                    results = envelope.results.len(),
                    message = envelope.message.as_deref().unwrap_or(""),
                    "listing count disagrees with its results"
                );
            }
        }
        let mut records = Vec::with_capacity(envelope.results.len());
        for (idx, item) in envelope.results.iter().enumerate() {
            match RawRecord::from_json(item) {
                Some(record) => records.push(record),
                None => warn!(origin, idx, "skipping non-object result entry"),
            }
        }
        Ok(Self { records, payload })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The two logical upstream operations. Either may fail per call; callers
/// decide whether a failure is fatal.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn list_makes(&self) -> Result<Listing, SourceError>;

    async fn list_models(&self, make_id: WorkKey) -> Result<Listing, SourceError>;
}

#[derive(Debug, Clone)]
pub struct VpicEndpoints {
    base_url: String,
}

impl VpicEndpoints {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn makes_url(&self) -> String {
        format!("{}/vehicles/getallmakes?format=json", self.base_url)
    }

    pub fn models_url(&self, make_id: WorkKey) -> String {
        format!(
            "{}/vehicles/GetModelsForMakeId/{make_id}?format=json",
            self.base_url
        )
    }
}

impl Default for VpicEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

pub struct VpicApiSource {
    http: HttpFetcher,
    endpoints: VpicEndpoints,
}

impl VpicApiSource {
    pub fn new(http: HttpFetcher, endpoints: VpicEndpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl CatalogSource for VpicApiSource {
    fn source_id(&self) -> &'static str {
        "vpic-api"
    }

    async fn list_makes(&self) -> Result<Listing, SourceError> {
        let url = self.endpoints.makes_url();
        info!(%url, "fetching makes");
        let payload = self.http.fetch_json(&url).await?;
        let listing = Listing::from_payload(&url, payload)?;
        info!(records = listing.len(), "fetched makes");
        Ok(listing)
    }

    async fn list_models(&self, make_id: WorkKey) -> Result<Listing, SourceError> {
        let url = self.endpoints.models_url(make_id);
        info!(make_id, %url, "fetching models");
        let payload = self.http.fetch_json(&url).await?;
        Listing::from_payload(&url, payload)
    }
}

/// Serves recorded envelopes from `<root>/makes.json` and
/// `<root>/models/<make_id>.json`. A missing model file fails that unit.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_listing(&self, path: PathBuf) -> Result<Listing, SourceError> {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SourceError::Fixture {
                path: path.clone(),
                source,
            })?;
        let origin = path.display().to_string();
        let payload = serde_json::from_str(&text).map_err(|source| SourceError::Parse {
            origin: origin.clone(),
            source,
        })?;
        Listing::from_payload(&origin, payload)
    }
}

#[async_trait]
impl CatalogSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn list_makes(&self) -> Result<Listing, SourceError> {
        self.read_listing(self.root.join("makes.json")).await
    }

    async fn list_models(&self, make_id: WorkKey) -> Result<Listing, SourceError> {
        self.read_listing(self.root.join("models").join(format!("{make_id}.json")))
            .await
    }
}
