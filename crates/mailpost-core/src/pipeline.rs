//! Session orchestrator
//!
//! Owns one SMTP session from the first DATA byte until its staging artifact
//! is removed. Completion of a session produces two independent signals: an
//! [`Ack`] the listener returns to the client right away, and a background
//! pipeline task that authenticates, normalizes, detects the language and
//! delivers the envelope.
//!
//! Step graph for one message:
//!
//! ```text
//! stage ──┬── authenticate-dkim ─────────────────────┐
//!         ├── authenticate-spf ──────────────────────┼── compose ── deliver
//!         └── normalize ── detect-language ──────────┘
//! ```
//!
//! Whatever happens, the artifact is disposed when the pipeline reaches
//! [`PipelineState::Done`].

use crate::auth::{AuthSettings, AuthValidator};
use crate::language::{top_language, LanguageDetector, LANGUAGE_CANDIDATES};
use crate::normalize::{MailNormalizer, NormalizedMail};
use crate::webhook::{DeliveryOutcome, WebhookDispatcher};
use chrono::{DateTime, Utc};
use mailpost_common::types::{EmailAddress, MailEnvelope, Verdict};
use mailpost_common::Error;
use mailpost_storage::{StagingId, StagingStore, StagingWriter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Connection metadata captured when a session starts
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMeta {
    pub remote_addr: SocketAddr,
    pub remote_host: String,
    pub helo: Option<String>,
    /// `None` for the null sender `<>`
    pub envelope_from: Option<EmailAddress>,
    pub envelope_to: Vec<EmailAddress>,
}

/// Pipeline states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Receiving,
    Staged,
    Authenticating,
    Composing,
    Delivering,
    Done,
}

/// Steps that can fail outright
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Stage,
    AuthenticateDkim,
    AuthenticateSpf,
    Normalize,
    DetectLanguage,
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStep::Stage => "stage",
            PipelineStep::AuthenticateDkim => "authenticate-dkim",
            PipelineStep::AuthenticateSpf => "authenticate-spf",
            PipelineStep::Normalize => "normalize",
            PipelineStep::DetectLanguage => "detect-language",
        };
        f.write_str(name)
    }
}

/// A step error that stops composition for one message
#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct StepFailure {
    pub step: PipelineStep,
    #[source]
    pub source: Error,
}

impl StepFailure {
    fn new(step: PipelineStep, source: Error) -> Self {
        Self { step, source }
    }
}

/// How a pipeline ended
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The envelope was composed and handed to the dispatcher
    Completed {
        envelope: Box<MailEnvelope>,
        delivery: DeliveryOutcome,
    },
    /// A step failed; nothing was delivered
    Aborted(StepFailure),
}

/// Summary of one finished pipeline
#[derive(Debug)]
pub struct PipelineReport {
    pub staging_id: StagingId,
    /// Last state entered before `Done`
    pub reached: PipelineState,
    pub outcome: PipelineOutcome,
    /// The artifact was removed by this pipeline
    pub disposed: bool,
}

impl PipelineReport {
    pub fn envelope(&self) -> Option<&MailEnvelope> {
        match &self.outcome {
            PipelineOutcome::Completed { envelope, .. } => Some(envelope.as_ref()),
            PipelineOutcome::Aborted(_) => None,
        }
    }

    pub fn delivery(&self) -> Option<&DeliveryOutcome> {
        match &self.outcome {
            PipelineOutcome::Completed { delivery, .. } => Some(delivery),
            PipelineOutcome::Aborted(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match &self.outcome {
            PipelineOutcome::Completed { .. } => None,
            PipelineOutcome::Aborted(failure) => Some(failure),
        }
    }
}

/// One SMTP transaction being received
#[derive(Debug)]
pub struct Session {
    id: StagingId,
    meta: SessionMeta,
    started_at: DateTime<Utc>,
    writer: Option<StagingWriter>,
    failure: Option<Error>,
    received: u64,
}

impl Session {
    pub fn id(&self) -> &StagingId {
        &self.id
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    /// Bytes received so far, including any that could not be staged
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Append a chunk of message data in arrival order.
    ///
    /// A staging write error is remembered and fails the pipeline later; the
    /// listener keeps draining the client's data either way.
    pub async fn append(&mut self, chunk: &[u8]) {
        self.received += chunk.len() as u64;

        if self.failure.is_some() {
            return;
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.append(chunk).await {
                warn!(staging_id = %self.id, "Failed to stage message data: {}", e);
                self.failure = Some(e);
                self.writer = None;
            }
        }
    }
}

/// Acknowledgment handed back to the SMTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub staging_id: StagingId,
}

impl Ack {
    /// Text of the positive reply
    pub fn reply(&self) -> String {
        format!("2.0.0 OK: queued as {}", self.staging_id)
    }
}

/// Result of completing a session
#[derive(Debug)]
pub struct Accepted {
    pub ack: Ack,
    /// Background pipeline; the listener never waits on it. Dropping the
    /// handle detaches the task, which stays tracked for shutdown.
    pub pipeline: JoinHandle<PipelineReport>,
}

/// Session orchestrator
pub struct Orchestrator {
    store: StagingStore,
    validator: Arc<dyn AuthValidator>,
    auth: AuthSettings,
    normalizer: MailNormalizer,
    detector: Arc<dyn LanguageDetector>,
    dispatcher: WebhookDispatcher,
    pipelines: TaskTracker,
}

impl Orchestrator {
    /// Create an orchestrator. `auth` is the startup availability decision
    /// and applies to every session for the life of the process.
    pub fn new(
        store: StagingStore,
        validator: Arc<dyn AuthValidator>,
        auth: AuthSettings,
        detector: Arc<dyn LanguageDetector>,
        dispatcher: WebhookDispatcher,
    ) -> Self {
        Self {
            store,
            validator,
            auth,
            normalizer: MailNormalizer::new(),
            detector,
            dispatcher,
            pipelines: TaskTracker::new(),
        }
    }

    /// Pipelines still running
    pub fn in_flight(&self) -> usize {
        self.pipelines.len()
    }

    /// Wait for every running pipeline to finish and dispose its artifact.
    ///
    /// Sessions completed while waiting are still processed.
    pub async fn shutdown(&self) {
        self.pipelines.close();
        self.pipelines.wait().await;
    }

    #[cfg(test)]
    fn store(&self) -> &StagingStore {
        &self.store
    }

    /// Start a session and open its staging artifact
    pub async fn start_session(&self, meta: SessionMeta) -> Session {
        let id = StagingId::generate();

        let (writer, failure) = match self.store.begin(&id).await {
            Ok(writer) => (Some(writer), None),
            Err(e) => {
                error!(staging_id = %id, "Failed to create staging file: {}", e);
                (None, Some(e))
            }
        };

        info!(
            staging_id = %id,
            peer = %meta.remote_addr,
            remote_host = %meta.remote_host,
            from = ?meta.envelope_from.as_ref().map(ToString::to_string),
            recipients = meta.envelope_to.len(),
            "Session started"
        );
        debug!(staging_id = %id, state = ?PipelineState::Receiving, "Pipeline state");

        Session {
            id,
            meta,
            started_at: Utc::now(),
            writer,
            failure,
            received: 0,
        }
    }

    /// Data transfer finished: acknowledge now, process in the background
    pub fn complete(self: &Arc<Self>, session: Session) -> Accepted {
        let ack = Ack {
            staging_id: session.id.clone(),
        };

        let orchestrator = Arc::clone(self);
        let pipeline = self
            .pipelines
            .spawn(async move { orchestrator.run(session).await });

        Accepted { ack, pipeline }
    }

    /// The session ended without a complete message; drop what was staged
    pub async fn abort(&self, session: Session) {
        let Session {
            id, writer, received, ..
        } = session;
        drop(writer);

        info!(staging_id = %id, received, "Session aborted before data completed");

        if let Err(e) = self.store.dispose(&id).await {
            error!(staging_id = %id, "Failed to dispose staging file: {}", e);
        }
    }

    async fn run(&self, session: Session) -> PipelineReport {
        let staging_id = session.id.clone();
        let mut state = PipelineState::Receiving;

        let outcome = match self.process(session, &mut state).await {
            Ok((envelope, delivery)) => PipelineOutcome::Completed {
                envelope: Box::new(envelope),
                delivery,
            },
            Err(failure) => {
                error!(
                    staging_id = %staging_id,
                    step = %failure.step,
                    code = failure.source.code(),
                    "Pipeline aborted: {}",
                    failure
                );
                PipelineOutcome::Aborted(failure)
            }
        };

        debug!(staging_id = %staging_id, state = ?PipelineState::Done, "Pipeline state");
        let disposed = match self.store.dispose(&staging_id).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(staging_id = %staging_id, "Failed to dispose staging file: {}", e);
                false
            }
        };

        PipelineReport {
            staging_id,
            reached: state,
            outcome,
            disposed,
        }
    }

    async fn process(
        &self,
        session: Session,
        state: &mut PipelineState,
    ) -> Result<(MailEnvelope, DeliveryOutcome), StepFailure> {
        let Session {
            id,
            meta,
            started_at,
            writer,
            failure,
            ..
        } = session;

        if let Some(e) = failure {
            return Err(StepFailure::new(PipelineStep::Stage, e));
        }
        let writer = writer.ok_or_else(|| {
            StepFailure::new(
                PipelineStep::Stage,
                Error::Staging("Session has no staging file".to_string()),
            )
        })?;

        let staged = writer
            .finalize()
            .await
            .map_err(|e| StepFailure::new(PipelineStep::Stage, e))?;
        let raw: Arc<[u8]> = staged
            .read()
            .await
            .map_err(|e| StepFailure::new(PipelineStep::Stage, e))?
            .into();
        advance(&id, state, PipelineState::Staged);
        debug!(staging_id = %id, size = staged.size(), "Message staged");

        advance(&id, state, PipelineState::Authenticating);
        let (dkim, spf, content) = tokio::join!(
            self.authenticate_dkim(&raw),
            self.authenticate_spf(&meta),
            self.extract_content(Arc::clone(&raw)),
        );

        let mut failures = Vec::new();
        let dkim = dkim.map_err(|f| failures.push(f)).ok();
        let spf = spf.map_err(|f| failures.push(f)).ok();
        let content = content.map_err(|f| failures.push(f)).ok();

        let (Some(dkim), Some(spf), Some((mail, language))) = (dkim, spf, content) else {
            let mut failures = failures.into_iter();
            let first = failures.next().unwrap_or_else(|| {
                StepFailure::new(
                    PipelineStep::Stage,
                    Error::Internal("Step finished without output".to_string()),
                )
            });
            for other in failures {
                warn!(staging_id = %id, step = %other.step, "Additional step failure: {}", other);
            }
            return Err(first);
        };

        advance(&id, state, PipelineState::Composing);
        info!(
            staging_id = %id,
            dkim = %dkim,
            spf = %spf,
            language = %language,
            "Message authenticated and normalized"
        );
        let envelope = compose(&id, &meta, started_at, mail, dkim, spf, language);

        advance(&id, state, PipelineState::Delivering);
        let delivery = self.dispatcher.deliver(&envelope).await;

        Ok((envelope, delivery))
    }

    async fn authenticate_dkim(&self, raw: &[u8]) -> Result<Verdict, StepFailure> {
        if !self.auth.dkim_active() {
            return Ok(Verdict::Failed);
        }

        self.validator
            .validate_dkim(raw)
            .await
            .map(Verdict::from)
            .map_err(|e| StepFailure::new(PipelineStep::AuthenticateDkim, e))
    }

    async fn authenticate_spf(&self, meta: &SessionMeta) -> Result<Verdict, StepFailure> {
        if !self.auth.spf_active() {
            return Ok(Verdict::Failed);
        }

        let envelope_from = meta
            .envelope_from
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();

        self.validator
            .validate_spf(meta.remote_addr.ip(), &envelope_from, &meta.remote_host)
            .await
            .map(Verdict::from)
            .map_err(|e| StepFailure::new(PipelineStep::AuthenticateSpf, e))
    }

    /// Normalize, then detect the language of the normalized text
    async fn extract_content(
        &self,
        raw: Arc<[u8]>,
    ) -> Result<(NormalizedMail, String), StepFailure> {
        let normalizer = self.normalizer.clone();
        let mail = tokio::task::spawn_blocking(move || normalizer.normalize(&raw))
            .await
            .map_err(|e| {
                StepFailure::new(
                    PipelineStep::Normalize,
                    Error::Internal(format!("Normalizer task failed: {}", e)),
                )
            })?
            .map_err(|e| StepFailure::new(PipelineStep::Normalize, e))?;

        let guesses = self
            .detector
            .detect(&mail.text, LANGUAGE_CANDIDATES)
            .await
            .map_err(|e| StepFailure::new(PipelineStep::DetectLanguage, e))?;

        Ok((mail, top_language(&guesses)))
    }
}

fn advance(id: &StagingId, state: &mut PipelineState, next: PipelineState) {
    *state = next;
    debug!(staging_id = %id, state = ?next, "Pipeline state");
}

fn compose(
    id: &StagingId,
    meta: &SessionMeta,
    started_at: DateTime<Utc>,
    mail: NormalizedMail,
    dkim: Verdict,
    spf: Verdict,
    language: String,
) -> MailEnvelope {
    MailEnvelope {
        id: id.to_string(),
        headers: mail.headers,
        subject: mail.subject,
        from: mail.from,
        to: mail.to,
        cc: mail.cc,
        date: mail.date,
        message_id: mail.message_id,
        text: mail.text,
        html: mail.html,
        attachments: mail.attachments,
        dkim,
        spf,
        language,
        envelope_from: meta.envelope_from.as_ref().map(ToString::to_string),
        envelope_to: meta.envelope_to.iter().map(ToString::to_string).collect(),
        remote_address: meta.remote_addr.ip().to_string(),
        remote_host: meta.remote_host.clone(),
        helo: meta.helo.clone(),
        received_at: started_at.to_rfc3339(),
    }
}
