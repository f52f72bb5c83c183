//! Incremental harvest orchestration: bootstrap, normalize, select, fetch, load.

pub mod config;
pub mod load;
pub mod normalize;
pub mod report;
pub mod schema;
pub mod select;
pub mod store;
pub mod transform;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use vpic_adapters::{CatalogSource, FixtureSource, VpicApiSource, VpicEndpoints};
use vpic_core::{
    store_column_name, CanonicalTable, CellValue, ColumnType, RawRecord, WorkKey, MAKES, MODELS,
};
use vpic_storage::{
    merge_table_file, read_csv, read_key_column, read_table, write_json_snapshot, write_table,
    FileReport, HttpClientConfig, HttpFetcher, MergeFileReport, TokenBucketConfig,
};

pub use config::{DatabaseConfig, HarvestConfig, LedgerSource, DEFAULT_MODELS_LIMIT};
pub use load::{LoadError, StagingUpsertLoader};
pub use normalize::{NormalizeError, Normalized, Normalizer, ValidationWarning, Violation};
pub use report::{count_models_per_make, render_counts, MakeModelCount};
pub use schema::DdlBootstrapper;
pub use select::{loaded_key_set, select_remaining, work_keys};
pub use store::{MemoryStore, MergeBatch, MergeResult, PgStore, StoreError, TargetStore};
pub use transform::to_store_layout;

pub const CRATE_NAME: &str = "vpic-sync";

const PREVIEW_ROWS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub makes: usize,
    pub make_warnings: usize,
    pub remaining_keys: Vec<WorkKey>,
    pub fetched_units: usize,
    pub failed_units: usize,
    pub empty_units: usize,
    pub models: usize,
    pub model_warnings: usize,
    pub makes_merge: MergeResult,
    pub models_merge: MergeResult,
    pub makes_file: Option<FileReport>,
    pub models_file: Option<MergeFileReport>,
    pub raw_snapshot: Option<FileReport>,
    pub model_counts: Vec<MakeModelCount>,
}

impl SyncRunSummary {
    fn start(source: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            source: source.to_string(),
            started_at: now,
            finished_at: now,
            makes: 0,
            make_warnings: 0,
            remaining_keys: Vec::new(),
            fetched_units: 0,
            failed_units: 0,
            empty_units: 0,
            models: 0,
            model_warnings: 0,
            makes_merge: MergeResult::default(),
            models_merge: MergeResult::default(),
            makes_file: None,
            models_file: None,
            raw_snapshot: None,
            model_counts: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    source: Box<dyn CatalogSource>,
    store: Arc<dyn TargetStore>,
    ddl: DdlBootstrapper,
    normalizer: Normalizer,
}

impl HarvestPipeline {
    pub fn new(
        config: HarvestConfig,
        source: Box<dyn CatalogSource>,
        store: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            ddl: DdlBootstrapper::for_catalog(),
            normalizer: Normalizer::new(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub async fn bootstrap(&self) -> Result<()> {
        self.ddl
            .ensure_schema(self.store.as_ref())
            .await
            .context("bootstrapping target schema")
    }

    /// Make ids already represented in the models ledger.
    async fn loaded_make_ids(&self) -> Result<Vec<CellValue>> {
        match self.config.ledger {
            LedgerSource::Store => self
                .store
                .loaded_keys(MODELS.store_table, &store_column_name("Make_ID"))
                .await
                .context("reading loaded make ids from store"),
            LedgerSource::File => {
                let path = self.config.models_file();
                read_key_column(&path, "Make_ID", ColumnType::Integer)
                    .await
                    .with_context(|| format!("reading loaded make ids from {}", path.display()))
            }
        }
    }

    /// Makes in `makes` that have no models in the ledger yet, capped at `limit`.
    pub async fn remaining_work(
        &self,
        makes: &CanonicalTable,
        limit: Option<usize>,
    ) -> Result<Vec<WorkKey>> {
        let all = work_keys(makes, "Make_ID");
        let loaded = loaded_key_set(&self.loaded_make_ids().await?);
        let remaining = select_remaining(&all, &loaded, limit);
        info!(
            candidates = all.len(),
            already_loaded = loaded.len(),
            remaining = remaining.len(),
            ?limit,
            "selected makes to fetch models for"
        );
        Ok(remaining)
    }

    /// Remaining work computed from the saved makes file (`from_file`) or a
    /// fresh makes listing, without loading anything.
    pub async fn plan(&self, from_file: bool, limit: Option<usize>) -> Result<Vec<WorkKey>> {
        let records = if from_file {
            let path = self.config.makes_file();
            read_table(&path, &MAKES)
                .await
                .with_context(|| format!("reading {}", path.display()))?
        } else {
            self.source
                .list_makes()
                .await
                .context("listing makes")?
                .records
        };
        let makes = self
            .normalizer
            .normalize(&MAKES, &records)
            .context("normalizing makes")?;
        self.remaining_work(&makes.table, limit).await
    }

    async fn fetch_makes(&self, summary: &mut SyncRunSummary) -> Result<Vec<RawRecord>> {
        let listing = match self.source.list_makes().await {
            Ok(listing) => listing,
            Err(err) => {
                error!(error = %err, "fetching makes failed");
                return Ok(Vec::new());
            }
        };
        if self.config.save_raw_snapshot {
            let path = self.config.makes_snapshot_file();
            let report = write_json_snapshot(&path, &listing.payload)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), records = report.rows, "saved raw makes payload");
            summary.raw_snapshot = Some(report);
        }
        Ok(listing.records)
    }

    #[instrument(skip_all, fields(source = self.source.source_id()))]
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::start(self.source.source_id());
        info!(run_id = %summary.run_id, "harvest run started");
        self.bootstrap().await?;
        let loader = StagingUpsertLoader::new(self.store.clone());

        let raw_makes = self.fetch_makes(&mut summary).await?;
        let makes = self
            .normalizer
            .normalize(&MAKES, &raw_makes)
            .context("normalizing makes")?;
        summary.makes = makes.table.len();
        summary.make_warnings = makes.diagnostics.len();
        info!(
            "preview of the first {PREVIEW_ROWS} makes:\n{}",
            makes.table.preview(PREVIEW_ROWS)
        );

        let makes_path = self.config.makes_file();
        summary.makes_file = Some(
            write_table(&makes_path, &makes.table)
                .await
                .with_context(|| format!("writing {}", makes_path.display()))?,
        );

        let loaded_at = Utc::now();
        summary.makes_merge = loader
            .load(
                &to_store_layout(&makes.table, loaded_at),
                MAKES.store_table,
                &MAKES.store_key_columns(),
                None,
            )
            .await
            .context("loading makes")?;

        summary.remaining_keys = self
            .remaining_work(&makes.table, self.config.models_limit)
            .await?;
        if summary.remaining_keys.is_empty() {
            info!("no new makes to fetch models for; finishing");
            return Ok(summary.finish());
        }

        let mut raw_models = Vec::new();
        for &make_id in &summary.remaining_keys {
            match self.source.list_models(make_id).await {
                Ok(listing) => {
                    summary.fetched_units += 1;
                    if listing.is_empty() {
                        summary.empty_units += 1;
                        info!(make_id, "make lists no models");
                    }
                    raw_models.extend(listing.records);
                }
                Err(err) => {
                    summary.failed_units += 1;
                    warn!(make_id, error = %err, "fetching models failed; make will be retried next run");
                }
            }
        }
        info!(
            fetched = summary.fetched_units,
            failed = summary.failed_units,
            records = raw_models.len(),
            "model fetch batch finished"
        );

        if raw_models.is_empty() && summary.fetched_units > 0 {
            info!("fetched makes returned no models; nothing to load");
            return Ok(summary.finish());
        }
        let models = self
            .normalizer
            .normalize(&MODELS, &raw_models)
            .context("normalizing models")?;
        summary.models = models.table.len();
        summary.model_warnings = models.diagnostics.len();
        info!(
            "preview of the first {PREVIEW_ROWS} models:\n{}",
            models.table.preview(PREVIEW_ROWS)
        );

        summary.model_counts = count_models_per_make(&makes.table, &models.table);
        info!("models per make:\n{}", render_counts(&summary.model_counts));

        let models_path = self.config.models_file();
        summary.models_file = Some(
            merge_table_file(&models_path, &models.table, MODELS.key_columns)
                .await
                .with_context(|| format!("merging into {}", models_path.display()))?,
        );

        summary.models_merge = loader
            .load(
                &to_store_layout(&models.table, loaded_at),
                MODELS.store_table,
                &MODELS.store_key_columns(),
                None,
            )
            .await
            .context("loading models")?;

        let summary = summary.finish();
        info!(
            run_id = %summary.run_id,
            makes = summary.makes,
            models = summary.models,
            inserted = summary.models_merge.inserted,
            updated = summary.models_merge.updated,
            "harvest run finished"
        );
        Ok(summary)
    }
}

pub fn http_fetcher(config: &HarvestConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config
            .requests_per_second
            .filter(|rps| *rps > 0)
            .map(|rps| TokenBucketConfig {
                capacity: rps,
                refill_every: Duration::from_secs(1) / rps,
            }),
        ..Default::default()
    })
}

/// Store behind the pipeline: PostgreSQL, or an in-memory store for dry runs.
pub async fn open_store(config: &HarvestConfig, dry_run: bool) -> Result<Arc<dyn TargetStore>> {
    if dry_run {
        info!("dry run: loading into an in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = PgStore::connect(&config.database.connection_url())
        .await
        .with_context(|| format!("connecting to {}", config.database.redacted()))?;
    Ok(Arc::new(store))
}

/// Upstream listings: recorded fixture files when `fixtures` is set, the
/// vPIC API otherwise.
pub fn catalog_source(
    config: &HarvestConfig,
    fixtures: Option<&Path>,
) -> Result<Box<dyn CatalogSource>> {
    Ok(match fixtures {
        Some(root) => Box::new(FixtureSource::new(root)),
        None => Box::new(VpicApiSource::new(
            http_fetcher(config)?,
            VpicEndpoints::new(config.api_base_url.clone()),
        )),
    })
}

pub async fn run_sync_once(
    mut config: HarvestConfig,
    dry_run: bool,
    fixtures: Option<&Path>,
) -> Result<SyncRunSummary> {
    if dry_run {
        config = config.into_dry_run();
        info!(data_dir = %config.data_dir.display(), "dry run: files go to a separate directory");
    }
    let source = catalog_source(&config, fixtures)?;
    let store = open_store(&config, dry_run).await?;
    HarvestPipeline::new(config, source, store).run_once().await
}

/// Extract a delimited file, map it into the store layout and upsert it
/// into `target` on `key_columns`.
#[instrument(skip_all, fields(path = %path.display(), table = target))]
pub async fn load_file(
    store: Arc<dyn TargetStore>,
    path: &Path,
    target: &str,
    key_columns: &[String],
    staging: Option<&str>,
) -> Result<MergeResult> {
    DdlBootstrapper::for_catalog()
        .ensure_schema(store.as_ref())
        .await
        .context("bootstrapping target schema")?;
    let table = read_csv(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let table = to_store_layout(&table, Utc::now());
    let key_columns = key_columns
        .iter()
        .map(|k| store_column_name(k))
        .collect::<Vec<_>>();
    StagingUpsertLoader::new(store)
        .load(&table, target, &key_columns, staging)
        .await
        .with_context(|| format!("loading {} into {target}", path.display()))
}
