//! facefindr-core: face detection, embedding and selfie matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime, and ranks an event's photos against the faces
//! found in a selfie.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use embedder::{EmbedError, EmbedderSettings, FaceEmbedder, ModelPaths, OnnxFaceEmbedder};
pub use matcher::{
    best_pair_similarity, match_against_collection, verify_pair, MatchCriterion, MatchOptions,
    MatchReport, PairVerdict, SkipCounts,
};
pub use provider::{
    lazy_candidates, Candidate, CandidateFetchError, CandidateResult, CandidateSource, MemorySource,
    ProviderError,
};
pub use types::{BoundingBox, Embedding, FaceDetection, MatchCandidate};
