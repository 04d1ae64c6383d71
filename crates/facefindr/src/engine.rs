use crate::config::Config;
use facefindr_core::types::embeddings_of;
use facefindr_core::{
    lazy_candidates, match_against_collection, verify_pair, CandidateSource, EmbedError,
    FaceDetection, FaceEmbedder, MatchCriterion, MatchOptions, MatchReport, OnnxFaceEmbedder,
    PairVerdict, ProviderError,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("no face detected in selfie")]
    NoFaceInSelfie,
    #[error("failed to start engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Per-request defaults taken from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub criterion: MatchCriterion,
    pub top_k: Option<usize>,
    pub request_timeout: Duration,
    pub prefetch: usize,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            criterion: config.criterion,
            top_k: config.top_k,
            request_timeout: config.request_timeout(),
            prefetch: config.prefetch,
        }
    }
}

/// A selfie to rank against the photos of one event.
pub struct MatchRequest {
    pub selfie: Vec<u8>,
    pub source: Arc<dyn CandidateSource>,
    pub event: String,
    /// Overrides the configured criterion.
    pub criterion: Option<MatchCriterion>,
    /// Overrides the configured top-k.
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResponse {
    /// Faces found in the selfie; each one is compared with every candidate.
    pub selfie_faces: usize,
    #[serde(flatten)]
    pub report: MatchReport,
}

/// Messages sent from handles to the engine thread.
enum EngineRequest {
    Match {
        request: MatchRequest,
        options: MatchOptions,
        reply: oneshot::Sender<Result<MatchResponse, EngineError>>,
    },
    Embed {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceDetection>, EngineError>>,
    },
    Verify {
        selfie: Vec<u8>,
        image: Vec<u8>,
        criterion: MatchCriterion,
        reply: oneshot::Sender<Result<PairVerdict, EngineError>>,
    },
    Shutdown,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    settings: Arc<EngineSettings>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// Rank the event's photos against the faces in the selfie.
    ///
    /// The request deadline starts now, so time spent queued behind other
    /// requests counts against it.
    pub async fn find_matches(&self, request: MatchRequest) -> Result<MatchResponse, EngineError> {
        let accepted = Instant::now();
        let options = MatchOptions {
            criterion: request.criterion.unwrap_or(self.settings.criterion),
            top_k: request.top_k.or(self.settings.top_k),
            // A timeout too large to represent means no deadline.
            deadline: accepted.checked_add(self.settings.request_timeout),
            prefetch: self.settings.prefetch,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Match {
            request,
            options,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Detect and embed every face in one image.
    pub async fn embed(&self, image: Vec<u8>) -> Result<Vec<FaceDetection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Embed {
            image,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Compare a selfie with one photo.
    pub async fn verify(
        &self,
        selfie: Vec<u8>,
        image: Vec<u8>,
        criterion: Option<MatchCriterion>,
    ) -> Result<PairVerdict, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineRequest::Verify {
            selfie,
            image,
            criterion: criterion.unwrap_or(self.settings.criterion),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the engine thread after queued requests drain, and wait for it.
    /// Requests through other clones of this handle fail afterwards.
    pub async fn shutdown(self) {
        let _ = self.tx.send(EngineRequest::Shutdown).await;
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => tracing::info!("engine stopped"),
                Ok(Err(_)) => tracing::error!("engine thread panicked"),
                Err(e) => tracing::error!(error = %e, "failed to join engine thread"),
            }
        }
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load the ONNX models and start the engine.
///
/// Model loading happens here, before the thread starts, so a missing or
/// broken model fails the caller immediately.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let embedder = OnnxFaceEmbedder::load(&config.model_paths(), config.embedder_settings())?;
    spawn_with_embedder(Arc::new(embedder), EngineSettings::from(config))
}

/// Start the engine thread around an already constructed embedder.
pub fn spawn_with_embedder(
    embedder: Arc<dyn FaceEmbedder>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    let thread = std::thread::Builder::new()
        .name("facefindr-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Match {
                        request,
                        options,
                        reply,
                    } => {
                        let result = run_match(embedder.as_ref(), request, &options);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { image, reply } => {
                        let result = embedder.detect_and_embed(&image).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Verify {
                        selfie,
                        image,
                        criterion,
                        reply,
                    } => {
                        let result = verify_pair(embedder.as_ref(), &selfie, &image, &criterion)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Shutdown => break,
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        settings: Arc::new(settings),
        thread: Arc::new(Mutex::new(Some(thread))),
    })
}

/// Embed the selfie, then scan the event's candidates.
fn run_match(
    embedder: &dyn FaceEmbedder,
    request: MatchRequest,
    options: &MatchOptions,
) -> Result<MatchResponse, EngineError> {
    let selfie = embedder.detect_and_embed(&request.selfie)?;
    if selfie.is_empty() {
        tracing::info!(event = %request.event, "match rejected: no face in selfie");
        return Err(EngineError::NoFaceInSelfie);
    }
    let query = embeddings_of(&selfie);

    let candidates = lazy_candidates(request.source.as_ref(), &request.event)?;
    let report = match_against_collection(embedder, &query, candidates, options)?;

    tracing::info!(
        event = %request.event,
        selfie_faces = query.len(),
        matches = report.matches.len(),
        "match request complete"
    );
    Ok(MatchResponse {
        selfie_faces: query.len(),
        report,
    })
}
