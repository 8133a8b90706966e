//! Job orchestration: drives a schema's sources through fetch, extraction
//! and pagination, one page at a time.
//!
//! Within a job, pages are processed strictly in order. The anti-detection
//! delay is the only intentional suspension point and is raced against the
//! cancellation token, so one job's wait never blocks another job. Row
//! extraction runs on the blocking pool.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::anti_detection::{self, RequestContext};
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::extract::{PageExtraction, RowResult, extract_page};
use crate::job::{Job, JobStatus, LogEntry, LogLevel, Progress};
use crate::models::{ExtractedItem, page_signature};
use crate::pagination::{NextOrStop, PageSignals, PaginationController, StopReason, first_page_url};
use crate::proxy_pool::ProxyPool;
use crate::schema::{CompiledSchema, MissingRequiredPolicy, Schema};
use crate::traits::{FetchRequest, Fetcher, Storage};
use crate::transform::TransformRegistry;

/// Snapshot published to subscribers after every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: Progress,
}

impl From<&Job> for JobUpdate {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            status: job.status(),
            progress: job.progress(),
        }
    }
}

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Started {
        job_id: Uuid,
        schema: &'a str,
        sources: usize,
    },
    PageFetched {
        job_id: Uuid,
        url: &'a str,
        page: u32,
        items: usize,
    },
    FetchFailed {
        job_id: Uuid,
        url: &'a str,
        error: &'a str,
        streak: u32,
    },
    PaginationStopped {
        job_id: Uuid,
        source: &'a str,
        reason: StopReason,
    },
    Paused {
        job_id: Uuid,
    },
    Resumed {
        job_id: Uuid,
    },
    Finished {
        job_id: Uuid,
        status: JobStatus,
        items: u64,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Started {
                job_id,
                schema,
                sources,
            } => {
                tracing::info!(%job_id, %schema, sources, "Job started");
            }
            JobEvent::PageFetched {
                job_id,
                url,
                page,
                items,
            } => {
                tracing::info!(%job_id, %url, page, items, "Page extracted");
            }
            JobEvent::FetchFailed {
                job_id,
                url,
                error,
                streak,
            } => {
                tracing::warn!(%job_id, %url, %error, streak, "Fetch failed");
            }
            JobEvent::PaginationStopped {
                job_id,
                source,
                reason,
            } => {
                tracing::debug!(%job_id, %source, %reason, "Pagination stopped");
            }
            JobEvent::Paused { job_id } => {
                tracing::info!(%job_id, "Job paused");
            }
            JobEvent::Resumed { job_id } => {
                tracing::info!(%job_id, "Job resumed");
            }
            JobEvent::Finished {
                job_id,
                status,
                items,
            } => {
                tracing::info!(%job_id, %status, items, "Job finished");
            }
        }
    }
}

/// How the page loop ended, when it ended without an error.
enum Outcome {
    Completed,
    Cancelled,
}

/// Per-job control channels, owned by the running task.
struct Control {
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
    updates: watch::Sender<JobUpdate>,
}

impl Control {
    fn publish(&self, job: &Job) {
        self.updates.send_replace(JobUpdate::from(job));
    }
}

/// Handle to a job started with [`Orchestrator::start`].
pub struct JobHandle {
    job_id: Uuid,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    updates: watch::Receiver<JobUpdate>,
    task: JoinHandle<Job>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Request cooperative cancellation. The in-flight fetch, if any, finishes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Pause before the next fetch.
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn subscribe(&self) -> watch::Receiver<JobUpdate> {
        self.updates.clone()
    }

    /// Latest published status and progress.
    pub fn latest(&self) -> JobUpdate {
        self.updates.borrow().clone()
    }

    /// Wait for the job to reach a terminal state.
    pub async fn join(self) -> Result<Job, AppError> {
        self.task
            .await
            .map_err(|e| AppError::Generic(format!("Job task failed: {e}")))
    }
}

/// Runs extraction jobs against a fetcher and a store.
pub struct Orchestrator<F, S, R = TracingJobReporter>
where
    F: Fetcher,
    S: Storage,
    R: JobReporter,
{
    fetcher: F,
    store: S,
    reporter: Arc<R>,
    proxies: Option<ProxyPool>,
    registry: TransformRegistry,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl<F, S, R> Clone for Orchestrator<F, S, R>
where
    F: Fetcher,
    S: Storage,
    R: JobReporter,
{
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            reporter: Arc::clone(&self.reporter),
            proxies: self.proxies.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<F, S> Orchestrator<F, S, TracingJobReporter>
where
    F: Fetcher,
    S: Storage,
{
    pub fn new(fetcher: F, store: S, config: EngineConfig) -> Self {
        Self {
            fetcher,
            store,
            reporter: Arc::new(TracingJobReporter),
            proxies: None,
            registry: TransformRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }
}

impl<F, S, R> Orchestrator<F, S, R>
where
    F: Fetcher + 'static,
    S: Storage + 'static,
    R: JobReporter + 'static,
{
    pub fn with_reporter<R2: JobReporter>(self, reporter: R2) -> Orchestrator<F, S, R2> {
        Orchestrator {
            fetcher: self.fetcher,
            store: self.store,
            reporter: Arc::new(reporter),
            proxies: self.proxies,
            registry: self.registry,
            config: self.config,
            shutdown: self.shutdown,
        }
    }

    /// Share a proxy pool with every job this orchestrator runs.
    pub fn with_proxy_pool(mut self, pool: ProxyPool) -> Self {
        self.proxies = Some(pool);
        self
    }

    /// Custom transforms available to schemas.
    pub fn with_registry(mut self, registry: TransformRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Cancelling `token` cancels every job started afterwards.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Compile `schema` and check it against this orchestrator's setup.
    fn prepare(&self, schema: &Schema) -> Result<Arc<CompiledSchema>, AppError> {
        let compiled = schema.compile(&self.registry)?;
        if schema.anti_detection.proxy_rotation
            && self.proxies.as_ref().is_none_or(ProxyPool::is_empty)
        {
            return Err(AppError::ConfigError(format!(
                "schema '{}' asks for proxy rotation but no proxies are configured",
                schema.name
            )));
        }
        Ok(Arc::new(compiled))
    }

    /// Validate `schema` and run it to completion on the current task.
    pub async fn run(&self, schema: &Schema) -> Result<Job, AppError> {
        let compiled = self.prepare(schema)?;
        let job = Job::new(schema);
        let (_pause_tx, pause) = watch::channel(false);
        let (updates, _) = watch::channel(JobUpdate::from(&job));
        let control = Control {
            cancel: self.shutdown.child_token(),
            pause,
            updates,
        };
        Ok(self.execute(compiled, job, control).await)
    }

    /// Validate `schema` and spawn its job on the tokio runtime.
    pub fn start(&self, schema: &Schema) -> Result<JobHandle, AppError> {
        let compiled = self.prepare(schema)?;
        let job = Job::new(schema);
        let job_id = job.id();

        let cancel = self.shutdown.child_token();
        let (pause_tx, pause) = watch::channel(false);
        let (updates, updates_rx) = watch::channel(JobUpdate::from(&job));
        let control = Control {
            cancel: cancel.clone(),
            pause,
            updates,
        };

        let this = self.clone();
        let task = tokio::spawn(async move { this.execute(compiled, job, control).await });

        Ok(JobHandle {
            job_id,
            cancel,
            pause: pause_tx,
            updates: updates_rx,
            task,
        })
    }

    async fn execute(&self, schema: Arc<CompiledSchema>, mut job: Job, mut ctl: Control) -> Job {
        let outcome = self.drive(&schema, &mut job, &mut ctl).await;

        let finished = match outcome {
            Ok(Outcome::Completed) => job.transition(JobStatus::Completed),
            Ok(Outcome::Cancelled) => job.transition(JobStatus::Cancelled),
            Err(e) => {
                let message = e.to_string();
                if let Err(log_err) = job.log(LogEntry::new(LogLevel::Error, message.clone())) {
                    tracing::debug!(job_id = %job.id(), error = %log_err, "Failure not logged on job");
                }
                job.fail(message)
            }
        };
        if let Err(e) = finished {
            tracing::error!(job_id = %job.id(), error = %e, "Failed to finish job");
        }

        self.checkpoint(&job).await;
        ctl.publish(&job);
        self.reporter.report(JobEvent::Finished {
            job_id: job.id(),
            status: job.status(),
            items: job.progress().items_extracted(),
        });
        job
    }

    async fn drive(
        &self,
        schema: &Arc<CompiledSchema>,
        job: &mut Job,
        ctl: &mut Control,
    ) -> Result<Outcome, AppError> {
        let definition = schema.schema();
        let pagination = schema.pagination();
        let max_items = pagination.max_items();
        let fetch_limit = definition.error_policy.max_consecutive_fetch_errors;
        let headers = definition.request_headers();

        if ctl.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        job.transition(JobStatus::Running)?;
        let estimate: u64 = definition
            .source
            .urls
            .iter()
            .map(|u| {
                PaginationController::new(u, &pagination, self.config.default_max_pages)
                    .max_pages() as u64
            })
            .sum();
        job.raise_total_pages(estimate)?;
        ctl.publish(job);
        self.checkpoint(job).await;
        self.reporter.report(JobEvent::Started {
            job_id: job.id(),
            schema: &definition.name,
            sources: definition.source.urls.len(),
        });

        let mut streak = 0u32;
        'sources: for source in &definition.source.urls {
            let mut controller =
                PaginationController::new(source, &pagination, self.config.default_max_pages);
            let mut url = first_page_url(source);

            loop {
                if self.wait_while_paused(job, ctl).await? {
                    return Ok(Outcome::Cancelled);
                }

                let context = RequestContext {
                    url: &url,
                    page: controller.current_page(),
                };
                let Some(fetched) = self.fetch_page(definition, &headers, context, ctl).await else {
                    return Ok(Outcome::Cancelled);
                };

                let mut signals = PageSignals::default();
                match fetched {
                    Ok(body) => {
                        streak = 0;
                        let extraction = self.extract(schema, body, &url).await?;
                        job.record_page()?;
                        let items = self.absorb(job, definition, &url, extraction, max_items, &mut signals)?;
                        self.reporter.report(JobEvent::PageFetched {
                            job_id: job.id(),
                            url: &url,
                            page: controller.current_page(),
                            items,
                        });
                    }
                    Err(e) => {
                        streak += 1;
                        let message = e.to_string();
                        self.reporter.report(JobEvent::FetchFailed {
                            job_id: job.id(),
                            url: &url,
                            error: &message,
                            streak,
                        });
                        job.record_error()?;
                        job.log(LogEntry::new(LogLevel::Error, message.clone()).with_url(url.clone()))?;
                        if fetch_limit > 0 && streak >= fetch_limit {
                            return Err(AppError::Generic(format!(
                                "{streak} consecutive fetch errors, last: {message}"
                            )));
                        }
                        signals.fetch_failed = true;
                    }
                }
                signals.items_extracted_total = job.progress().items_extracted();

                if self.config.checkpoint_every_page {
                    self.checkpoint(job).await;
                }
                ctl.publish(job);

                if ctl.cancel.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }
                match controller.next(&pagination, &signals) {
                    NextOrStop::Next(next) => url = next,
                    NextOrStop::Stop(reason) => {
                        self.reporter.report(JobEvent::PaginationStopped {
                            job_id: job.id(),
                            source,
                            reason,
                        });
                        if reason != StopReason::NotPaginated {
                            job.log(
                                LogEntry::new(LogLevel::Info, format!("Pagination stopped: {reason}"))
                                    .with_url(url.clone()),
                            )?;
                        }
                        if reason == StopReason::MaxItems {
                            break 'sources;
                        }
                        break;
                    }
                }
            }
        }
        Ok(Outcome::Completed)
    }

    /// Plan and send one request. `None` means the job was cancelled during
    /// the politeness delay. A plan without a usable proxy fails like a fetch.
    async fn fetch_page(
        &self,
        definition: &Schema,
        headers: &[(String, String)],
        context: RequestContext<'_>,
        ctl: &Control,
    ) -> Option<Result<String, AppError>> {
        let plan = match anti_detection::plan(context, &definition.anti_detection, self.proxies.as_ref()) {
            Ok(plan) => plan,
            Err(e) => return Some(Err(e)),
        };
        if !plan.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(plan.delay) => {}
                () = ctl.cancel.cancelled() => return None,
            }
        }

        let mut request_headers = headers.to_vec();
        for (name, value) in plan.headers {
            if !request_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(&name)) {
                request_headers.push((name, value));
            }
        }
        let request = FetchRequest {
            url: context.url.to_string(),
            headers: request_headers,
            user_agent: plan.user_agent,
            proxy: plan.proxy,
        };

        let started = Instant::now();
        let fetched = self.fetcher.fetch(&request).await;
        if let (Some(pool), Some(proxy)) = (&self.proxies, &request.proxy) {
            pool.record_outcome(proxy, fetched.is_ok(), started.elapsed());
        }
        Some(fetched)
    }

    /// Block while paused. Returns true when cancelled.
    async fn wait_while_paused(&self, job: &mut Job, ctl: &mut Control) -> Result<bool, AppError> {
        if ctl.cancel.is_cancelled() {
            return Ok(true);
        }
        if !*ctl.pause.borrow_and_update() {
            return Ok(false);
        }

        job.transition(JobStatus::Paused)?;
        ctl.publish(job);
        self.checkpoint(job).await;
        self.reporter.report(JobEvent::Paused { job_id: job.id() });

        while *ctl.pause.borrow_and_update() {
            tokio::select! {
                changed = ctl.pause.changed() => {
                    // Handle dropped: nobody can resume, so carry on.
                    if changed.is_err() {
                        break;
                    }
                }
                () = ctl.cancel.cancelled() => return Ok(true),
            }
        }

        job.transition(JobStatus::Running)?;
        ctl.publish(job);
        self.reporter.report(JobEvent::Resumed { job_id: job.id() });
        Ok(false)
    }

    async fn extract(
        &self,
        schema: &Arc<CompiledSchema>,
        body: String,
        url: &str,
    ) -> Result<PageExtraction, AppError> {
        let page_url = Url::parse(url)
            .map_err(|e| AppError::Generic(format!("Invalid page URL '{url}': {e}")))?;
        let schema = Arc::clone(schema);
        let workers = self.config.row_concurrency;
        tokio::task::spawn_blocking(move || extract_page(&schema, &body, &page_url, workers))
            .await
            .map_err(|e| AppError::Generic(format!("Extraction task failed: {e}")))
    }

    /// Append a page's rows to the job, in row order, honoring `max_items`
    /// and the missing-required policy. Returns the number of items kept.
    fn absorb(
        &self,
        job: &mut Job,
        schema: &Schema,
        url: &str,
        extraction: PageExtraction,
        max_items: Option<u64>,
        signals: &mut PageSignals,
    ) -> Result<usize, AppError> {
        signals.items_on_page = extraction.item_count();
        signals.links = extraction.signals.links;
        signals.next_present = extraction.signals.next_present;
        signals.stop_selector_missing = extraction.signals.stop_selector_missing;

        let mut hashes = Vec::new();
        let mut kept = 0;
        for RowResult { data, warnings } in extraction.rows {
            if max_items.is_some_and(|max| job.progress().items_extracted() >= max) {
                break;
            }
            match data {
                Ok(data) => {
                    for w in warnings {
                        let message = format!("{} (field '{}' on {})", w.message, w.field, url);
                        job.record_field_failure(&w.field)?;
                        job.log(
                            LogEntry::new(LogLevel::Warn, message)
                                .with_url(url)
                                .with_field(w.field),
                        )?;
                    }
                    let item = ExtractedItem::new(url, data);
                    hashes.push(item.hash.clone());
                    job.push_result(item)?;
                    kept += 1;
                }
                Err(e) => {
                    if let Some(field) = e.field() {
                        job.record_field_failure(field)?;
                    }
                    match schema.error_policy.on_missing_required {
                        MissingRequiredPolicy::FailJob => return Err(e),
                        MissingRequiredPolicy::SkipItem => {
                            tracing::debug!(job_id = %job.id(), %url, error = %e, "Item skipped");
                            let mut entry = LogEntry::new(LogLevel::Warn, format!("Item skipped: {e}"))
                                .with_url(url);
                            entry.field = e.field().map(str::to_string);
                            job.record_error()?;
                            job.log(entry)?;
                        }
                    }
                }
            }
        }

        if !hashes.is_empty() {
            signals.page_signature = Some(page_signature(hashes.iter().map(String::as_str)));
        }
        Ok(kept)
    }

    async fn checkpoint(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            tracing::error!(job_id = %job.id(), error = %e, "Failed to save job checkpoint");
        }
    }
}
