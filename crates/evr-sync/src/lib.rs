//! Refresh pipeline: purge, acquire, validate, deduplicate, enrich, admit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Months, NaiveDate, Utc};
use evr_adapters::{
    CandidateSource, ChatCompletionSource, ChatConfig, FileCandidateSource, GenerationError,
    GenerationRequest,
};
use evr_core::{same_calendar_day, validate, Category, Event, EventKey, EventRecord, RawEvent, RejectReason};
use evr_storage::{ConflictPolicy, EventStore, Filter, RestStore, StoreConfig};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use strsim::sorensen_dice;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evr-sync";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub events_table: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub event_count: usize,
    pub horizon_months: u32,
    pub candidates_file: Option<PathBuf>,
    pub dedup: DedupConfig,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let candidates_file = get("EVR_CANDIDATES_FILE").map(PathBuf::from);
        let openai_api_key = get("OPENAI_API_KEY");
        if candidates_file.is_none() && openai_api_key.is_none() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }

        let policy = match get("EVR_DEDUP_POLICY").as_deref() {
            None | Some("fuzzy") => DedupPolicy::Fuzzy,
            Some("exact") => DedupPolicy::Exact,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "EVR_DEDUP_POLICY",
                    value: other.to_string(),
                })
            }
        };
        let threshold = parse_or("EVR_DEDUP_THRESHOLD", get("EVR_DEDUP_THRESHOLD"), 0.8_f64)?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                name: "EVR_DEDUP_THRESHOLD",
                value: threshold.to_string(),
            });
        }

        Ok(Self {
            supabase_url: required("SUPABASE_URL")?,
            supabase_service_key: required("SUPABASE_SERVICE_KEY")?,
            events_table: get("EVR_EVENTS_TABLE").unwrap_or_else(|| "events".to_string()),
            openai_api_key,
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: get("EVR_MODEL").unwrap_or_else(|| "gpt-4".to_string()),
            temperature: parse_or("EVR_TEMPERATURE", get("EVR_TEMPERATURE"), 0.7_f32)?,
            event_count: parse_or("EVR_EVENT_COUNT", get("EVR_EVENT_COUNT"), 12_usize)?,
            horizon_months: parse_or("EVR_HORIZON_MONTHS", get("EVR_HORIZON_MONTHS"), 9_u32)?,
            candidates_file,
            dedup: DedupConfig { policy, threshold },
            http_timeout_secs: parse_or("EVR_HTTP_TIMEOUT_SECS", get("EVR_HTTP_TIMEOUT_SECS"), 30_u64)?,
            user_agent: get("EVR_USER_AGENT").unwrap_or_else(|| "event-refresh/0.1".to_string()),
            scheduler_enabled: get("EVR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("EVR_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * Mon".to_string()),
        })
    }

    pub fn generation_request(&self, today: NaiveDate) -> GenerationRequest {
        let until = today
            .checked_add_months(Months::new(self.horizon_months))
            .unwrap_or(today);
        GenerationRequest::new(self.event_count, until)
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DedupPolicy {
    /// Same name and same start date.
    Exact,
    /// Same start date and name similarity at or above the threshold.
    Fuzzy,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupConfig {
    pub policy: DedupPolicy,
    pub threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            policy: DedupPolicy::Fuzzy,
            threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub existing: EventKey,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> DedupConfig {
        self.config
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn name_similarity(a: &str, b: &str) -> f64 {
        sorensen_dice(
            &Self::normalize_key_fragment(a),
            &Self::normalize_key_fragment(b),
        )
    }

    /// Best pool entry the candidate duplicates, if any. Never mutates the pool.
    pub fn find_duplicate<'a, I>(&self, candidate: &EventKey, pool: I) -> Option<DuplicateMatch>
    where
        I: IntoIterator<Item = &'a EventKey>,
    {
        let same_day = pool
            .into_iter()
            .filter(|existing| same_calendar_day(&existing.start_date, &candidate.start_date));

        match self.config.policy {
            DedupPolicy::Exact => same_day
                .filter(|existing| existing.name.trim() == candidate.name.trim())
                .map(|existing| DuplicateMatch {
                    existing: existing.clone(),
                    score: 1.0,
                })
                .next(),
            DedupPolicy::Fuzzy => same_day
                .map(|existing| (existing, Self::name_similarity(&existing.name, &candidate.name)))
                .filter(|(_, score)| *score >= self.config.threshold)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(existing, score)| DuplicateMatch {
                    existing: existing.clone(),
                    score,
                }),
        }
    }
}

/// Comparison set for duplicate detection: the pre-run snapshot plus this run's admissions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DuplicatePool {
    snapshot: Vec<EventKey>,
    admitted: Vec<EventKey>,
}

impl DuplicatePool {
    pub fn new(snapshot: Vec<EventKey>) -> Self {
        Self {
            snapshot,
            admitted: Vec::new(),
        }
    }

    pub fn with_admitted(mut self, key: EventKey) -> Self {
        self.admitted.push(key);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventKey> {
        self.snapshot.iter().chain(self.admitted.iter())
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn admitted_len(&self) -> usize {
        self.admitted.len()
    }
}

const CULTURE_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?festival,lanterns",
    "https://source.unsplash.com/1600x900/?parade,tradition",
    "https://source.unsplash.com/1600x900/?temple,celebration",
];
const SEASONAL_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?cherry-blossom",
    "https://source.unsplash.com/1600x900/?autumn,leaves",
    "https://source.unsplash.com/1600x900/?christmas-market",
];
const MUSIC_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?concert,crowd",
    "https://source.unsplash.com/1600x900/?music-festival,stage",
    "https://source.unsplash.com/1600x900/?orchestra",
];
const ARTS_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?art-gallery",
    "https://source.unsplash.com/1600x900/?theatre,stage",
    "https://source.unsplash.com/1600x900/?street-art",
];
const ICONIC_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?fireworks,city",
    "https://source.unsplash.com/1600x900/?landmark,night",
    "https://source.unsplash.com/1600x900/?carnival",
];
const NATURE_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?aurora",
    "https://source.unsplash.com/1600x900/?wildflowers,field",
    "https://source.unsplash.com/1600x900/?wildlife,migration",
];
const SPORTS_IMAGES: &[&str] = &[
    "https://source.unsplash.com/1600x900/?stadium",
    "https://source.unsplash.com/1600x900/?marathon,runners",
    "https://source.unsplash.com/1600x900/?race,motorsport",
];

/// Built-in image references per category. Unknown categories have none.
pub fn builtin_images(category: &Category) -> &'static [&'static str] {
    match category {
        Category::Culture => CULTURE_IMAGES,
        Category::Seasonal => SEASONAL_IMAGES,
        Category::Music => MUSIC_IMAGES,
        Category::Arts => ARTS_IMAGES,
        Category::Iconic => ICONIC_IMAGES,
        Category::Nature => NATURE_IMAGES,
        Category::Sports => SPORTS_IMAGES,
        Category::Unknown(_) => &[],
    }
}

/// Placeholder used when a category has no images; keyed by the lowercased category.
pub fn fallback_image_url(category: &Category) -> String {
    let words = category
        .as_str()
        .to_lowercase()
        .split_whitespace()
        .map(|word| {
            word.chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .collect::<String>()
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>();
    let slug = if words.is_empty() {
        "event".to_string()
    } else {
        words.join("+")
    };
    format!("https://source.unsplash.com/1600x900/?{slug}")
}

#[derive(Debug, Clone)]
pub struct ImageCatalog {
    images: HashMap<Category, Vec<String>>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ImageCatalog {
    pub fn builtin() -> Self {
        let images = Category::KNOWN
            .iter()
            .map(|category| {
                let urls = builtin_images(category).iter().map(|u| u.to_string()).collect();
                (category.clone(), urls)
            })
            .collect();
        Self { images }
    }

    pub fn with_images(mut self, category: Category, urls: Vec<String>) -> Self {
        self.images.insert(category, urls);
        self
    }

    pub fn images_for(&self, category: &Category) -> &[String] {
        self.images.get(category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Uniform pick from the category's list, or the placeholder when there is nothing to pick.
    pub fn pick<R: Rng + ?Sized>(&self, category: &Category, rng: &mut R) -> String {
        self.images_for(category)
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| fallback_image_url(category))
    }
}

/// Turn a validated event into the stored record: fresh id, image filled if missing.
pub fn enrich<R: Rng + ?Sized>(event: Event, images: &ImageCatalog, rng: &mut R) -> EventRecord {
    let image_url = match &event.image_url {
        Some(url) => url.clone(),
        None => images.pick(&event.category, rng),
    };
    EventRecord::from_event(event, Uuid::new_v4(), image_url)
}

/// What the pipeline decided for one candidate before any write.
#[derive(Debug, Clone, PartialEq)]
pub enum Screening {
    Rejected(RejectReason),
    Duplicate { event: Event, matched: DuplicateMatch },
    Admissible(Event),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Inserted {
        name: String,
        start_date: String,
        id: Uuid,
        status: u16,
    },
    Invalid {
        candidate: String,
        reason: String,
    },
    Duplicate {
        name: String,
        start_date: String,
        matched: String,
        score: f64,
    },
    Failed {
        name: String,
        id: Uuid,
        status: Option<u16>,
        error: String,
    },
}

/// Accumulator threaded through the admission loop.
#[derive(Debug, Clone, Default)]
pub struct AdmissionState {
    pub pool: DuplicatePool,
    pub outcomes: Vec<CandidateOutcome>,
    pub admitted: Vec<EventRecord>,
}

impl AdmissionState {
    pub fn new(pool: DuplicatePool) -> Self {
        Self {
            pool,
            outcomes: Vec::new(),
            admitted: Vec::new(),
        }
    }

    fn record(mut self, outcome: CandidateOutcome) -> Self {
        self.outcomes.push(outcome);
        self
    }

    fn admit(mut self, record: EventRecord, outcome: CandidateOutcome) -> Self {
        self.pool = self.pool.with_admitted(record.key());
        self.admitted.push(record);
        self.record(outcome)
    }

    fn count(&self, pred: impl Fn(&CandidateOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|&o| pred(o)).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub purge_status: Option<u16>,
    pub snapshot_size: usize,
    pub candidates: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub failed: usize,
    pub outcomes: Vec<CandidateOutcome>,
}

impl RunSummary {
    pub fn summary_line(&self) -> String {
        format!(
            "refresh complete: run_id={} candidates={} inserted={} duplicates={} invalid={} failed={}",
            self.run_id, self.candidates, self.inserted, self.duplicates, self.invalid, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeOutcome {
    pub cutoff: NaiveDate,
    pub status: Option<u16>,
    pub error: Option<String>,
}

pub struct RefreshPipeline {
    store: Arc<dyn EventStore>,
    source: Arc<dyn CandidateSource>,
    request: GenerationRequest,
    dedup: DedupEngine,
    images: ImageCatalog,
    conflict: ConflictPolicy,
    seed: Option<u64>,
}

impl RefreshPipeline {
    pub fn new(
        store: Arc<dyn EventStore>,
        source: Arc<dyn CandidateSource>,
        request: GenerationRequest,
    ) -> Self {
        Self {
            store,
            source,
            request,
            dedup: DedupEngine::default(),
            images: ImageCatalog::builtin(),
            conflict: ConflictPolicy::natural_key(),
            seed: None,
        }
    }

    pub fn with_dedup(mut self, dedup: DedupEngine) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_images(mut self, images: ImageCatalog) -> Self {
        self.images = images;
        self
    }

    pub fn with_conflict_policy(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }

    /// Fix the image-selection RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        self.run_once_at(Utc::now().date_naive()).await
    }

    /// Full run with `today` as the purge cutoff.
    pub async fn run_once_at(&self, today: NaiveDate) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh_run", %run_id, source = self.source.source_id());
        async {
            let started_at = Utc::now();
            let purge = self.purge_expired(today).await;

            let batch = self.acquire().await?;
            let candidates = batch.len();

            let snapshot = self.load_snapshot(today).await;
            let snapshot_size = snapshot.len();
            let state = self.admit_batch(DuplicatePool::new(snapshot), &batch).await;

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                source_id: self.source.source_id().to_string(),
                purge_status: purge.status,
                snapshot_size,
                candidates,
                inserted: state.count(|o| matches!(o, CandidateOutcome::Inserted { .. })),
                duplicates: state.count(|o| matches!(o, CandidateOutcome::Duplicate { .. })),
                invalid: state.count(|o| matches!(o, CandidateOutcome::Invalid { .. })),
                failed: state.count(|o| matches!(o, CandidateOutcome::Failed { .. })),
                outcomes: state.outcomes,
            };
            info!(
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                invalid = summary.invalid,
                failed = summary.failed,
                "refresh finished"
            );
            Ok::<RunSummary, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Delete events that ended strictly before `today`. Never fails the run.
    pub async fn purge_expired(&self, today: NaiveDate) -> PurgeOutcome {
        let cutoff = today.format("%Y-%m-%d").to_string();
        match self.store.delete(&[Filter::lt("end_date", cutoff)]).await {
            Ok(status) => {
                info!(status, %today, "purged past events");
                PurgeOutcome {
                    cutoff: today,
                    status: Some(status),
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, %today, "purge of past events failed; continuing");
                PurgeOutcome {
                    cutoff: today,
                    status: err.status(),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Validate, deduplicate and enrich a fresh batch without writing anything.
    pub async fn preview(&self) -> Result<Vec<EventRecord>> {
        let batch = self.acquire().await?;
        let today = Utc::now().date_naive();
        let mut pool = DuplicatePool::new(self.load_snapshot(today).await);
        let mut rng = self.rng();
        let mut records = Vec::new();
        for raw in &batch {
            if let Screening::Admissible(event) = self.screen(&pool, raw) {
                let record = enrich(event, &self.images, &mut rng);
                pool = pool.with_admitted(record.key());
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn screen(&self, pool: &DuplicatePool, raw: &RawEvent) -> Screening {
        let event = match validate(raw) {
            Ok(event) => event,
            Err(reason) => return Screening::Rejected(reason),
        };
        match self.dedup.find_duplicate(&event.key(), pool.iter()) {
            Some(matched) => Screening::Duplicate { event, matched },
            None => Screening::Admissible(event),
        }
    }

    async fn acquire(&self) -> Result<Vec<RawEvent>> {
        match self.source.fetch_batch(&self.request).await {
            Ok(batch) => {
                info!(
                    source = %batch.source_id,
                    candidates = batch.candidates.len(),
                    "candidate batch acquired"
                );
                Ok(batch.candidates)
            }
            Err(err) => {
                if let GenerationError::Malformed { raw, .. } = &err {
                    error!(raw = %raw, "failed to parse generated batch");
                }
                Err(err).context("acquiring candidate batch")
            }
        }
    }

    // Only live events; keeps the pool under the store's per-response row cap.
    async fn load_snapshot(&self, today: NaiveDate) -> Vec<EventKey> {
        let live = Filter::gte("end_date", today.format("%Y-%m-%d").to_string());
        let rows = match self.store.select(&[live], &["name", "start_date"]).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "snapshot fetch failed; duplicate checks use in-run admissions only");
                return Vec::new();
            }
        };
        let total = rows.len();
        let keys: Vec<EventKey> = rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(row).ok())
            .collect();
        if keys.len() < total {
            warn!(skipped = total - keys.len(), "ignoring snapshot rows without name/start_date");
        }
        keys
    }

    async fn admit_batch(&self, pool: DuplicatePool, batch: &[RawEvent]) -> AdmissionState {
        let mut rng = self.rng();
        let mut state = AdmissionState::new(pool);
        for raw in batch {
            state = self.admit_one(state, raw, &mut rng).await;
        }
        state
    }

    async fn admit_one(&self, state: AdmissionState, raw: &RawEvent, rng: &mut StdRng) -> AdmissionState {
        let event = match self.screen(&state.pool, raw) {
            Screening::Rejected(reason) => {
                warn!(candidate = %raw.label(), reason = %reason, "skipping invalid candidate");
                return state.record(CandidateOutcome::Invalid {
                    candidate: raw.label(),
                    reason: reason.to_string(),
                });
            }
            Screening::Duplicate { event, matched } => {
                info!(
                    name = %event.name,
                    start_date = %event.start_date,
                    matched = %matched.existing.name,
                    score = matched.score,
                    "skipping duplicate"
                );
                return state.record(CandidateOutcome::Duplicate {
                    name: event.name,
                    start_date: event.start_date,
                    matched: matched.existing.name,
                    score: matched.score,
                });
            }
            Screening::Admissible(event) => event,
        };

        let record = enrich(event, &self.images, rng);
        match self.store.upsert(&record, &self.conflict).await {
            Ok(status) => {
                info!(name = %record.name, id = %record.id, status, "inserted event");
                let outcome = CandidateOutcome::Inserted {
                    name: record.name.clone(),
                    start_date: record.start_date.clone(),
                    id: record.id,
                    status,
                };
                state.admit(record, outcome)
            }
            Err(err) => {
                error!(name = %record.name, id = %record.id, error = %err, "failed to insert event");
                state.record(CandidateOutcome::Failed {
                    name: record.name,
                    id: record.id,
                    status: err.status(),
                    error: err.to_string(),
                })
            }
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

/// Wire the REST store and the configured candidate source.
pub fn pipeline_from_config(config: &SyncConfig) -> Result<RefreshPipeline> {
    let timeout = Duration::from_secs(config.http_timeout_secs);

    let mut store_config = StoreConfig::new(&config.supabase_url, &config.supabase_service_key);
    store_config.table = config.events_table.clone();
    store_config.timeout = timeout;
    store_config.user_agent = Some(config.user_agent.clone());
    let store = RestStore::new(store_config).context("creating event store client")?;

    let source: Arc<dyn CandidateSource> = match (&config.candidates_file, &config.openai_api_key) {
        (Some(path), _) => Arc::new(FileCandidateSource::new(path)),
        (None, Some(api_key)) => {
            let mut chat = ChatConfig::new(api_key);
            chat.base_url = config.openai_base_url.clone();
            chat.model = config.model.clone();
            chat.temperature = config.temperature;
            chat.timeout = timeout.max(Duration::from_secs(60));
            chat.user_agent = Some(config.user_agent.clone());
            Arc::new(ChatCompletionSource::new(chat).context("creating model client")?)
        }
        (None, None) => anyhow::bail!("no candidate source configured"),
    };

    let request = config.generation_request(Utc::now().date_naive());
    Ok(RefreshPipeline::new(Arc::new(store), source, request)
        .with_dedup(DedupEngine::new(config.dedup)))
}

pub async fn run_refresh_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config)?;
    pipeline.run_once().await
}

/// Cron-driven refresh. `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<RefreshPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!("{}", summary.summary_line()),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(error = %message, "scheduled refresh aborted");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
