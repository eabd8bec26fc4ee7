use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tracing::{error, info, warn};

use crate::{
    auth::Authorizer,
    blob_store::{BlobContainer, Bucket},
    data_model::{
        Artifact, ArtifactDetails, RunState, TaskRun, PUBLIC_NAME_PREFIX,
    },
    events::{ArtifactCreatedEvent, ArtifactPublisher},
    http_objects::{
        datetime_to_ms, ms_to_datetime, ArtifactView, CreateArtifactRequest,
        CreateArtifactResponse, ListArtifactsResponse, ListQuery,
    },
    region::RegionResolver,
    state_store::{ArtifactStore, CreateResult},
    utils::now_ms,
};

/// Slack absorbing clock drift between workers and this service.
const EXPIRES_GRACE_MS: u64 = 15 * 60 * 1000;
/// Uploads remain allowed this long after a run resolves as exception, so
/// workers can attach logs explaining the failure.
const EXCEPTION_WINDOW_MS: u64 = 25 * 60 * 1000;
/// Lifetime of upload and signed download credentials.
const SIGNED_URL_TTL: Duration = Duration::from_secs(30 * 60);
/// Put URLs get a few extra seconds so a credential minted at the TTL edge
/// is still accepted upstream.
const PUT_URL_TTL: Duration = Duration::from_secs(30 * 60 + 10);

const DEFAULT_PAGE_LIMIT: usize = 1000;
const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("{0}")]
    InputError(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Transport-facing request attributes consulted on the download path.
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    pub source_ip: Option<IpAddr>,
    pub skip_cache: bool,
}

/// Outcome of a download request: a redirect target, or the stored failure
/// for `error` artifacts.
#[derive(Debug, PartialEq)]
pub enum GetArtifactOutcome {
    Redirect(String),
    Denied { reason: String, message: String },
}

/// Orchestrates artifact creation, retrieval, and listing.
///
/// Owns the lifecycle state machine; storage backends, authorization,
/// region lookup, and event publication are injected capabilities.
pub struct ArtifactService {
    store: Arc<ArtifactStore>,
    public_bucket: Arc<Bucket>,
    private_bucket: Arc<Bucket>,
    container: Arc<BlobContainer>,
    regions: Arc<RegionResolver>,
    authorizer: Arc<dyn Authorizer>,
    publisher: Arc<ArtifactPublisher>,
    cloud_mirror_host: String,
}

impl ArtifactService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ArtifactStore>,
        public_bucket: Arc<Bucket>,
        private_bucket: Arc<Bucket>,
        container: Arc<BlobContainer>,
        regions: Arc<RegionResolver>,
        authorizer: Arc<dyn Authorizer>,
        publisher: Arc<ArtifactPublisher>,
        cloud_mirror_host: String,
    ) -> Self {
        ArtifactService {
            store,
            public_bucket,
            private_bucket,
            container,
            regions,
            authorizer,
            publisher,
            cloud_mirror_host,
        }
    }

    /// Register an artifact and hand back upload credentials.
    ///
    /// Re-creating an existing artifact with matching immutable fields is an
    /// idempotent success; the stored expiration only ever moves forward.
    pub async fn create_artifact(
        &self,
        task_id: &str,
        run_id: u32,
        name: &str,
        request: CreateArtifactRequest,
    ) -> Result<CreateArtifactResponse, ArtifactError> {
        let now = now_ms();
        let expires = datetime_to_ms(request.expires());
        if expires + EXPIRES_GRACE_MS < now {
            return Err(ArtifactError::InputError(
                "Expires must be in the future".to_string(),
            ));
        }

        let task = self
            .store
            .task(task_id)?
            .ok_or_else(|| ArtifactError::InputError("Task not found".to_string()))?;
        let run = task
            .runs
            .get(run_id as usize)
            .cloned()
            .ok_or_else(|| ArtifactError::InputError("Run not found".to_string()))?;

        let scope_sets = create_artifact_scopes(task_id, run_id, &run, name);
        if !self.authorizer.satisfies(&scope_sets).await? {
            return Err(ArtifactError::Unauthorized(format!(
                "insufficient scopes to create artifact {name} on {task_id}/{run_id}"
            )));
        }

        if expires > task.expires {
            return Err(ArtifactError::InputError(format!(
                "Artifact expires ({}) after the task expiration ({})",
                ms_to_datetime(expires),
                ms_to_datetime(task.expires)
            )));
        }

        match run.state {
            RunState::Running => {}
            RunState::Exception
                if run
                    .resolved
                    .is_some_and(|resolved| now.saturating_sub(resolved) <= EXCEPTION_WINDOW_MS) => {}
            state => {
                return Err(ArtifactError::Conflict(format!(
                    "artifacts cannot be created on run {run_id} in state {state}"
                )));
            }
        }

        let artifact = Artifact {
            task_id: task_id.to_string(),
            run_id,
            name: name.to_string(),
            content_type: request.content_type(),
            expires,
            details: self.build_details(task_id, run_id, name, &request),
        };

        let stored = match self.store.create(&artifact)? {
            CreateResult::Created => {
                info!(task_id, run_id, name, storage_type = artifact.storage_type(), "artifact created");
                artifact
            }
            CreateResult::Conflict(existing) => self.reconcile(existing, artifact)?,
        };

        // Publication follows the store commit; a failure here surfaces as a
        // server error but the committed record stands.
        let event = ArtifactCreatedEvent {
            status: task.status(),
            artifact: ArtifactView::from(&stored),
            run_id,
            worker_group: run.worker_group.clone(),
            worker_id: run.worker_id.clone(),
        };
        if let Err(err) = self.publisher.artifact_created(&event, &task.routes).await {
            error!(task_id, run_id, name, "failed to publish artifactCreated: {err:#}");
            return Err(ArtifactError::Internal(err));
        }

        self.upload_reply(&stored, now).await
    }

    /// Resolve a download request to its redirect target.
    ///
    /// `run_id = None` addresses the latest run.
    pub async fn get_artifact(
        &self,
        task_id: &str,
        run_id: Option<u32>,
        name: &str,
        ctx: &RequestContext,
    ) -> Result<GetArtifactOutcome, ArtifactError> {
        let run_id = match run_id {
            Some(run_id) => run_id,
            None => self.latest_run_id(task_id).await?,
        };

        if !name.starts_with(PUBLIC_NAME_PREFIX) {
            let scope_sets = vec![vec![format!("queue:get-artifact:{name}")]];
            if !self.authorizer.satisfies(&scope_sets).await? {
                return Err(ArtifactError::Unauthorized(format!(
                    "insufficient scopes to get artifact {name}"
                )));
            }
        }

        let artifact = self.store.load(task_id, run_id, name)?.ok_or_else(|| {
            ArtifactError::NotFound(format!("Artifact {name} not found on {task_id}/{run_id}"))
        })?;

        match &artifact.details {
            ArtifactDetails::S3 { bucket, prefix } if bucket == self.public_bucket.name() => {
                Ok(GetArtifactOutcome::Redirect(self.public_get_url(prefix, ctx)))
            }
            ArtifactDetails::S3 { bucket, prefix } if bucket == self.private_bucket.name() => {
                let url = self
                    .private_bucket
                    .create_signed_get_url(prefix, SIGNED_URL_TTL)
                    .await?;
                Ok(GetArtifactOutcome::Redirect(url))
            }
            ArtifactDetails::S3 { bucket, .. } => {
                error!(
                    artifact = %serde_json::to_string(&artifact).unwrap_or_default(),
                    "stored artifact references unknown bucket {bucket}"
                );
                Err(ArtifactError::Internal(anyhow!(
                    "artifact {} references unknown bucket {bucket}",
                    artifact.key()
                )))
            }
            ArtifactDetails::Azure { container, path } => {
                if container != self.container.container() {
                    error!(
                        artifact_container = %container,
                        configured = %self.container.container(),
                        "stored artifact container does not match configuration"
                    );
                }
                let url = self
                    .container
                    .create_signed_get_url(path, SIGNED_URL_TTL)
                    .await?;
                Ok(GetArtifactOutcome::Redirect(url))
            }
            ArtifactDetails::Reference { url } => Ok(GetArtifactOutcome::Redirect(url.clone())),
            ArtifactDetails::Error { message, reason } => Ok(GetArtifactOutcome::Denied {
                reason: reason.clone(),
                message: message.clone(),
            }),
        }
    }

    /// Page through a run's artifacts. `run_id = None` addresses the latest
    /// run.
    pub async fn list_artifacts(
        &self,
        task_id: &str,
        run_id: Option<u32>,
        query: ListQuery,
    ) -> Result<ListArtifactsResponse, ArtifactError> {
        let task = self
            .store
            .task(task_id)?
            .ok_or_else(|| ArtifactError::NotFound("Task not found".to_string()))?;
        let run_id = match run_id {
            Some(run_id) => run_id,
            None => task
                .latest_run_id()
                .ok_or_else(|| ArtifactError::NotFound(format!("Task {task_id} has no runs")))?,
        };
        if task.runs.get(run_id as usize).is_none() {
            return Err(ArtifactError::NotFound("Run not found".to_string()));
        }

        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
        let cursor = query
            .continuation_token
            .as_deref()
            .map(|token| URL_SAFE_NO_PAD.decode(token))
            .transpose()
            .map_err(|_| ArtifactError::InputError("Invalid continuation token".to_string()))?;

        let (artifacts, next) = self
            .store
            .list(task_id, run_id, cursor.as_deref(), limit)?;
        Ok(ListArtifactsResponse {
            artifacts: artifacts.iter().map(ArtifactView::from).collect(),
            continuation_token: next.map(|key| URL_SAFE_NO_PAD.encode(key)),
        })
    }

    async fn latest_run_id(&self, task_id: &str) -> Result<u32, ArtifactError> {
        let task = self
            .store
            .task(task_id)?
            .ok_or_else(|| ArtifactError::NotFound("Task not found".to_string()))?;
        task.latest_run_id()
            .ok_or_else(|| ArtifactError::NotFound(format!("Task {task_id} has no runs")))
    }

    fn build_details(
        &self,
        task_id: &str,
        run_id: u32,
        name: &str,
        request: &CreateArtifactRequest,
    ) -> ArtifactDetails {
        match request {
            CreateArtifactRequest::S3 { .. } => {
                let bucket = if name.starts_with(PUBLIC_NAME_PREFIX) {
                    self.public_bucket.name()
                } else {
                    self.private_bucket.name()
                };
                ArtifactDetails::S3 {
                    bucket: bucket.to_string(),
                    prefix: Artifact::object_path(task_id, run_id, name),
                }
            }
            CreateArtifactRequest::Azure { .. } => ArtifactDetails::Azure {
                container: self.container.container().to_string(),
                path: Artifact::object_path(task_id, run_id, name),
            },
            CreateArtifactRequest::Reference { url, .. } => ArtifactDetails::Reference {
                url: url.clone(),
            },
            CreateArtifactRequest::Error {
                message, reason, ..
            } => ArtifactDetails::Error {
                message: message.clone(),
                reason: reason.clone(),
            },
        }
    }

    /// Idempotency branch: a keyed insert lost to an existing record.
    ///
    /// Immutable fields must match; on a match the record absorbs the new
    /// expiration (never shortening it) and, for `reference` artifacts, the
    /// new target url.
    fn reconcile(&self, existing: Artifact, new: Artifact) -> Result<Artifact, ArtifactError> {
        if !existing.details.same_variant(&new.details) {
            return Err(ArtifactError::Conflict(format!(
                "artifact {} already exists with storage type {}",
                existing.key(),
                existing.storage_type()
            )));
        }
        if existing.content_type != new.content_type {
            return Err(ArtifactError::Conflict(format!(
                "artifact {} already exists with content type {}",
                existing.key(),
                existing.content_type
            )));
        }
        let details_match = matches!(
            (&existing.details, &new.details),
            (ArtifactDetails::Reference { .. }, ArtifactDetails::Reference { .. })
        ) || existing.details == new.details;
        if !details_match {
            return Err(ArtifactError::Conflict(format!(
                "artifact {} already exists with different details",
                existing.key()
            )));
        }

        warn!(key = %existing.key(), "artifact re-created, reconciling");
        let updated = self
            .store
            .modify(&new.task_id, new.run_id, &new.name, |artifact| {
                artifact.expires = artifact.expires.max(new.expires);
                if let (
                    ArtifactDetails::Reference { url },
                    ArtifactDetails::Reference { url: new_url },
                ) = (&mut artifact.details, &new.details)
                {
                    url.clone_from(new_url);
                }
            })?;
        Ok(updated)
    }

    async fn upload_reply(
        &self,
        artifact: &Artifact,
        now: u64,
    ) -> Result<CreateArtifactResponse, ArtifactError> {
        let url_expires = ms_to_datetime(now + SIGNED_URL_TTL.as_millis() as u64);
        match &artifact.details {
            ArtifactDetails::S3 { bucket, prefix } => {
                let bucket = [&self.public_bucket, &self.private_bucket]
                    .into_iter()
                    .find(|b| b.name() == bucket)
                    .ok_or_else(|| {
                        anyhow!("artifact {} references unknown bucket {bucket}", artifact.key())
                    })?;
                let put_url = bucket
                    .create_put_url(prefix, &artifact.content_type, PUT_URL_TTL)
                    .await?;
                Ok(CreateArtifactResponse::S3 {
                    content_type: artifact.content_type.clone(),
                    expires: url_expires,
                    put_url,
                })
            }
            ArtifactDetails::Azure { path, .. } => {
                let put_url = self
                    .container
                    .generate_write_sas(path, SIGNED_URL_TTL)
                    .await?;
                Ok(CreateArtifactResponse::Azure {
                    content_type: artifact.content_type.clone(),
                    expires: url_expires,
                    put_url,
                })
            }
            ArtifactDetails::Reference { .. } => Ok(CreateArtifactResponse::Reference),
            ArtifactDetails::Error { .. } => Ok(CreateArtifactResponse::Error),
        }
    }

    fn public_get_url(&self, prefix: &str, ctx: &RequestContext) -> String {
        if ctx.skip_cache {
            return self.public_bucket.create_get_url(prefix, false);
        }
        let region = ctx.source_ip.and_then(|ip| self.regions.region_of(ip));
        match region {
            None => self.public_bucket.create_get_url(prefix, false),
            Some(region) if region == self.public_bucket.region() => {
                self.public_bucket.create_get_url(prefix, true)
            }
            Some(region) => {
                let canonical = self.public_bucket.create_get_url(prefix, true);
                format!(
                    "https://{}/v1/redirect/s3/{}/{}",
                    self.cloud_mirror_host,
                    region,
                    urlencoding::encode(&canonical)
                )
            }
        }
    }
}

/// Scope sets accepted for createArtifact: the worker that owns the run, or
/// a caller holding the run-scoped creation scope.
fn create_artifact_scopes(
    task_id: &str,
    run_id: u32,
    run: &TaskRun,
    name: &str,
) -> Vec<Vec<String>> {
    let mut sets = Vec::new();
    if let (Some(worker_group), Some(worker_id)) = (&run.worker_group, &run.worker_id) {
        sets.push(vec![
            format!("queue:create-artifact:{name}"),
            format!("assume:worker-id:{worker_group}/{worker_id}"),
        ]);
    }
    sets.push(vec![format!("queue:create-artifact:{task_id}/{run_id}")]);
    sets
}
