//! Selfie matching: rank an event's photos by their best face-to-face score.
//!
//! The scan is a single pass over a lazy candidate sequence. Candidates that
//! cannot be fetched, decoded, or that contain no face are skipped and
//! counted; only an unavailable model aborts the scan.

use crate::embedder::{EmbedError, FaceEmbedder};
use crate::provider::CandidateResult;
use crate::types::{embeddings_of, Embedding, MatchCandidate};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::time::Instant;

pub const DEFAULT_MIN_SIMILARITY: f32 = 0.5;

/// Maximum cosine similarity over all pairs across the two sets.
///
/// Returns exactly 0.0 when either set is empty. Callers cannot tell "no
/// face" from "faces with zero similarity" by the score alone.
pub fn best_pair_similarity(a: &[Embedding], b: &[Embedding]) -> f32 {
    a.iter()
        .flat_map(|x| b.iter().map(move |y| x.similarity(y)))
        .reduce(f32::max)
        .unwrap_or(0.0)
}

/// Minimum euclidean distance over all pairs, `None` if either set is empty.
pub fn min_pair_distance(a: &[Embedding], b: &[Embedding]) -> Option<f32> {
    a.iter()
        .flat_map(|x| b.iter().map(move |y| x.euclidean_distance(y)))
        .reduce(f32::min)
}

/// Distance-based score `max(0, 1 - min distance)`; 0.0 for an empty set.
pub fn best_pair_distance_score(a: &[Embedding], b: &[Embedding]) -> f32 {
    min_pair_distance(a, b).map_or(0.0, distance_to_score)
}

fn distance_to_score(distance: f32) -> f32 {
    (1.0 - distance).max(0.0)
}

/// How a candidate's faces are compared with the query.
///
/// The two variants pull in opposite directions: a higher `min_similarity`
/// is stricter, a lower `max_distance` is stricter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum MatchCriterion {
    /// Keep when best cosine similarity > `min_similarity`.
    Cosine { min_similarity: f32 },
    /// Keep when minimum euclidean distance < `max_distance`.
    /// The reported score is `max(0, 1 - distance)`.
    Distance { max_distance: f32 },
}

impl Default for MatchCriterion {
    fn default() -> Self {
        Self::Cosine {
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }
}

/// Score for one comparison and whether it passed the criterion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairVerdict {
    pub matched: bool,
    pub similarity: f32,
}

impl MatchCriterion {
    /// Compare two embedding sets. An empty set never matches and scores 0.
    pub fn evaluate(&self, query: &[Embedding], candidate: &[Embedding]) -> PairVerdict {
        if query.is_empty() || candidate.is_empty() {
            return PairVerdict {
                matched: false,
                similarity: 0.0,
            };
        }
        match *self {
            Self::Cosine { min_similarity } => {
                let similarity = best_pair_similarity(query, candidate);
                PairVerdict {
                    matched: similarity > min_similarity,
                    similarity,
                }
            }
            Self::Distance { max_distance } => {
                let distance = min_pair_distance(query, candidate).unwrap_or(f32::INFINITY);
                PairVerdict {
                    matched: distance < max_distance,
                    similarity: distance_to_score(distance),
                }
            }
        }
    }
}

/// Per-request knobs for [`match_against_collection`].
#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub criterion: MatchCriterion,
    /// Keep only the N best matches.
    pub top_k: Option<usize>,
    /// Stop scanning once this instant has passed.
    pub deadline: Option<Instant>,
    /// Candidates fetched ahead of the embedding loop. 0 = fully sequential.
    pub prefetch: usize,
}

/// Why a candidate did not get a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    FetchFailed,
    InvalidImage,
    NoFace,
    InferenceFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub fetch_failed: usize,
    pub invalid_image: usize,
    pub no_face: usize,
    pub inference_failed: usize,
}

impl SkipCounts {
    fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::FetchFailed => self.fetch_failed += 1,
            SkipReason::InvalidImage => self.invalid_image += 1,
            SkipReason::NoFace => self.no_face += 1,
            SkipReason::InferenceFailed => self.inference_failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fetch_failed + self.invalid_image + self.no_face + self.inference_failed
    }
}

/// Ranked matches plus scan statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    /// Sorted by similarity, highest first; ties keep scan order.
    pub matches: Vec<MatchCandidate>,
    /// Candidates pulled from the sequence, including skipped ones.
    pub candidates_seen: usize,
    pub skipped: SkipCounts,
    /// The scan stopped early because the deadline passed.
    pub deadline_exceeded: bool,
}

struct Scan<'a, E: FaceEmbedder + ?Sized> {
    embedder: &'a E,
    query: &'a [Embedding],
    options: &'a MatchOptions,
    report: MatchReport,
}

impl<'a, E: FaceEmbedder + ?Sized> Scan<'a, E> {
    /// Returns `false` when the scan must stop (deadline reached).
    fn admit(&mut self) -> bool {
        match self.options.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.report.deadline_exceeded = true;
                false
            }
            _ => true,
        }
    }

    fn process(&mut self, item: CandidateResult) -> Result<(), EmbedError> {
        self.report.candidates_seen += 1;

        let candidate = match item {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(id = %e.id, reason = %e.reason, "skipping candidate: fetch failed");
                self.report.skipped.record(SkipReason::FetchFailed);
                return Ok(());
            }
        };

        let detections = match self.embedder.detect_and_embed(&candidate.bytes) {
            Ok(d) => d,
            Err(EmbedError::ModelUnavailable(msg)) => return Err(EmbedError::ModelUnavailable(msg)),
            Err(EmbedError::InvalidImage(msg)) => {
                tracing::warn!(id = %candidate.id, error = %msg, "skipping candidate: undecodable image");
                self.report.skipped.record(SkipReason::InvalidImage);
                return Ok(());
            }
            Err(EmbedError::Inference(msg)) => {
                tracing::warn!(id = %candidate.id, error = %msg, "skipping candidate: inference failed");
                self.report.skipped.record(SkipReason::InferenceFailed);
                return Ok(());
            }
        };

        if detections.is_empty() {
            tracing::debug!(id = %candidate.id, "skipping candidate: no face");
            self.report.skipped.record(SkipReason::NoFace);
            return Ok(());
        }

        let verdict = self.options.criterion.evaluate(self.query, &embeddings_of(&detections));
        tracing::debug!(
            id = %candidate.id,
            faces = detections.len(),
            similarity = verdict.similarity,
            matched = verdict.matched,
            "scored candidate"
        );
        if verdict.matched {
            self.report.matches.push(MatchCandidate {
                id: candidate.id,
                similarity: verdict.similarity,
            });
        }
        Ok(())
    }

    fn finish(mut self) -> MatchReport {
        // sort_by is stable: equal scores keep scan order.
        self.report
            .matches
            .sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        if let Some(k) = self.options.top_k {
            self.report.matches.truncate(k);
        }
        self.report
    }
}

/// Score every candidate against the query faces and rank the survivors.
///
/// Per-candidate failures are skipped and counted in the report. Only
/// [`EmbedError::ModelUnavailable`] aborts the scan. An empty query matches
/// nothing and returns an empty report without scanning.
pub fn match_against_collection<E, I>(
    embedder: &E,
    query: &[Embedding],
    candidates: I,
    options: &MatchOptions,
) -> Result<MatchReport, EmbedError>
where
    E: FaceEmbedder + ?Sized,
    I: IntoIterator<Item = CandidateResult>,
    I::IntoIter: Send,
{
    if query.is_empty() {
        tracing::info!("empty query; nothing to match");
        return Ok(MatchReport::default());
    }

    let started = Instant::now();
    let mut scan = Scan {
        embedder,
        query,
        options,
        report: MatchReport::default(),
    };

    if options.prefetch == 0 {
        for item in candidates {
            if !scan.admit() {
                break;
            }
            scan.process(item)?;
        }
    } else {
        let iter = candidates.into_iter();
        std::thread::scope(|s| -> Result<(), EmbedError> {
            let (tx, rx) = mpsc::sync_channel::<CandidateResult>(options.prefetch);
            s.spawn(move || {
                for item in iter {
                    // Receiver gone: the scan stopped early.
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            });
            for item in rx {
                if !scan.admit() {
                    break;
                }
                scan.process(item)?;
            }
            Ok(())
        })?;
    }

    let report = scan.finish();
    tracing::info!(
        seen = report.candidates_seen,
        matched = report.matches.len(),
        skipped = report.skipped.total(),
        deadline_exceeded = report.deadline_exceeded,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "match scan complete"
    );
    Ok(report)
}

/// Compare a selfie with a single photo.
///
/// No face on either side is not an error: the verdict is a non-match
/// scoring 0.0.
pub fn verify_pair<E: FaceEmbedder + ?Sized>(
    embedder: &E,
    selfie: &[u8],
    image: &[u8],
    criterion: &MatchCriterion,
) -> Result<PairVerdict, EmbedError> {
    let selfie_faces = embeddings_of(&embedder.detect_and_embed(selfie)?);
    let image_faces = embeddings_of(&embedder.detect_and_embed(image)?);
    Ok(criterion.evaluate(&selfie_faces, &image_faces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Candidate, CandidateFetchError};
    use crate::types::{BoundingBox, FaceDetection};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Unit query face; candidates are built at a chosen cosine to it.
    fn query() -> Vec<Embedding> {
        vec![Embedding::new(vec![1.0, 0.0])]
    }

    fn face_at(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).max(0.0).sqrt()]
    }

    enum Fixture {
        Faces(Vec<Vec<f32>>),
        Garbage,
        Broken,
        ModelDown,
    }

    /// Embedder keyed by the candidate bytes.
    #[derive(Default)]
    struct FakeEmbedder {
        images: HashMap<Vec<u8>, Fixture>,
    }

    impl FakeEmbedder {
        fn with(mut self, key: &str, fixture: Fixture) -> Self {
            self.images.insert(key.as_bytes().to_vec(), fixture);
            self
        }
    }

    impl FaceEmbedder for FakeEmbedder {
        fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<FaceDetection>, EmbedError> {
            match self.images.get(image) {
                Some(Fixture::Faces(faces)) => Ok(faces
                    .iter()
                    .map(|v| FaceDetection {
                        bbox: BoundingBox {
                            x: 0.0, y: 0.0, width: 10.0, height: 10.0,
                            confidence: 0.9, landmarks: None,
                        },
                        embedding: Embedding::new(v.clone()),
                    })
                    .collect()),
                Some(Fixture::Broken) => Err(EmbedError::Inference("session failed".into())),
                Some(Fixture::ModelDown) => Err(EmbedError::ModelUnavailable("gone".into())),
                Some(Fixture::Garbage) | None => Err(EmbedError::InvalidImage("unknown format".into())),
            }
        }
    }

    fn ok(id: &str) -> CandidateResult {
        Ok(Candidate { id: id.to_string(), bytes: id.as_bytes().to_vec() })
    }

    fn fetch_err(id: &str) -> CandidateResult {
        Err(CandidateFetchError { id: id.to_string(), reason: "timeout".into() })
    }

    fn cosine(min_similarity: f32) -> MatchOptions {
        MatchOptions {
            criterion: MatchCriterion::Cosine { min_similarity },
            ..Default::default()
        }
    }

    fn ids(report: &MatchReport) -> Vec<&str> {
        report.matches.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_best_pair_similarity_symmetric() {
        let a = vec![Embedding::new(vec![1.0, 0.0]), Embedding::new(vec![0.6, 0.8])];
        let b = vec![Embedding::new(vec![0.0, 1.0]), Embedding::new(vec![-1.0, 0.0])];
        assert_eq!(best_pair_similarity(&a, &b), best_pair_similarity(&b, &a));
        assert!((best_pair_similarity(&a, &b) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_best_pair_similarity_empty_is_zero_by_policy() {
        // 0.0 for an empty side is a fixed policy, not evidence of a
        // non-match: it equals the score of orthogonal faces.
        let a = vec![Embedding::new(vec![1.0, 0.0])];
        let orthogonal = vec![Embedding::new(vec![0.0, 1.0])];
        assert_eq!(best_pair_similarity(&a, &[]), 0.0);
        assert_eq!(best_pair_similarity(&[], &a), 0.0);
        assert_eq!(best_pair_similarity(&[], &[]), 0.0);
        assert!(best_pair_similarity(&a, &orthogonal).abs() < 1e-6);
    }

    #[test]
    fn test_best_pair_similarity_can_be_negative() {
        let a = vec![Embedding::new(vec![1.0, 0.0])];
        let b = vec![Embedding::new(vec![-1.0, 0.0])];
        assert!((best_pair_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_score() {
        let a = vec![Embedding::new(vec![1.0, 0.0])];
        let b = vec![Embedding::new(vec![0.8, 0.6]), Embedding::new(vec![-1.0, 0.0])];
        let expected = 1.0 - 0.4f32.sqrt();
        assert!((best_pair_distance_score(&a, &b) - expected).abs() < 1e-5);
        assert_eq!(best_pair_distance_score(&a, &[]), 0.0);
        // Far apart clamps to 0, never negative
        assert_eq!(best_pair_distance_score(&a, &b[1..]), 0.0);
    }

    #[test]
    fn test_criteria_strictness_runs_in_opposite_directions() {
        let q = query();
        let c = vec![Embedding::new(vec![0.8, 0.6])]; // cosine 0.8, distance ~0.632

        assert!(MatchCriterion::Cosine { min_similarity: 0.5 }.evaluate(&q, &c).matched);
        assert!(!MatchCriterion::Cosine { min_similarity: 0.9 }.evaluate(&q, &c).matched);

        assert!(MatchCriterion::Distance { max_distance: 0.7 }.evaluate(&q, &c).matched);
        assert!(!MatchCriterion::Distance { max_distance: 0.5 }.evaluate(&q, &c).matched);
    }

    #[test]
    fn test_criterion_threshold_is_exclusive() {
        let q = query();
        let c = vec![Embedding::new(vec![1.0, 0.0])];
        assert!(!MatchCriterion::Cosine { min_similarity: 1.0 }.evaluate(&q, &c).matched);
        assert!(!MatchCriterion::Distance { max_distance: 0.0 }.evaluate(&q, &c).matched);
    }

    #[test]
    fn test_scenario_threshold_and_no_face() {
        let embedder = FakeEmbedder::default()
            .with("imgA", Fixture::Faces(vec![face_at(0.9)]))
            .with("imgB", Fixture::Faces(vec![]))
            .with("imgC", Fixture::Faces(vec![face_at(0.3)]));

        let report = match_against_collection(
            &embedder,
            &query(),
            vec![ok("imgA"), ok("imgB"), ok("imgC")],
            &cosine(0.5),
        )
        .unwrap();

        assert_eq!(ids(&report), vec!["imgA"]);
        assert!((report.matches[0].similarity - 0.9).abs() < 1e-5);
        assert_eq!(report.skipped.no_face, 1);
        assert_eq!(report.candidates_seen, 3);
    }

    #[test]
    fn test_results_sorted_with_stable_ties() {
        let embedder = FakeEmbedder::default()
            .with("a", Fixture::Faces(vec![face_at(0.6)]))
            .with("b", Fixture::Faces(vec![face_at(0.95)]))
            .with("c", Fixture::Faces(vec![face_at(0.6)]))
            .with("d", Fixture::Faces(vec![face_at(0.2), face_at(0.8)]));

        let report = match_against_collection(
            &embedder,
            &query(),
            vec![ok("a"), ok("b"), ok("c"), ok("d")],
            &cosine(0.5),
        )
        .unwrap();

        assert_eq!(ids(&report), vec!["b", "d", "a", "c"]);
        assert!(report
            .matches
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }

    #[test]
    fn test_repeated_scans_are_identical() {
        let embedder = FakeEmbedder::default()
            .with("a", Fixture::Faces(vec![face_at(0.7)]))
            .with("b", Fixture::Faces(vec![face_at(0.7)]))
            .with("c", Fixture::Faces(vec![face_at(0.9)]));
        let input = || vec![ok("a"), ok("b"), ok("c")];

        let first = match_against_collection(&embedder, &query(), input(), &cosine(0.5)).unwrap();
        let second = match_against_collection(&embedder, &query(), input(), &cosine(0.5)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_prefetch_matches_sequential() {
        let mut embedder = FakeEmbedder::default();
        let mut input = Vec::new();
        for i in 0..40 {
            let id = format!("img{i:02}");
            let sim = [0.55, 0.9, 0.2, 0.7][i % 4];
            embedder = embedder.with(&id, Fixture::Faces(vec![face_at(sim)]));
            input.push(id);
        }
        let candidates = || input.iter().map(|id| ok(id)).collect::<Vec<_>>();

        let sequential = match_against_collection(&embedder, &query(), candidates(), &cosine(0.5)).unwrap();
        let prefetched = match_against_collection(
            &embedder,
            &query(),
            candidates(),
            &MatchOptions { prefetch: 4, ..cosine(0.5) },
        )
        .unwrap();

        assert_eq!(sequential, prefetched);
        assert_eq!(sequential.matches.len(), 30);
        assert_eq!(sequential.matches[0].id, "img01");
    }

    #[test]
    fn test_fetch_failure_leaves_others_unaffected() {
        let embedder = FakeEmbedder::default()
            .with("1", Fixture::Faces(vec![face_at(0.9)]))
            .with("2", Fixture::Faces(vec![face_at(0.8)]))
            .with("3", Fixture::Faces(vec![face_at(0.7)]))
            .with("4", Fixture::Faces(vec![face_at(0.6)]))
            .with("5", Fixture::Faces(vec![face_at(0.95)]));

        let healthy = match_against_collection(
            &embedder,
            &query(),
            vec![ok("1"), ok("2"), ok("4"), ok("5")],
            &cosine(0.5),
        )
        .unwrap();
        let with_failure = match_against_collection(
            &embedder,
            &query(),
            vec![ok("1"), ok("2"), fetch_err("3"), ok("4"), ok("5")],
            &cosine(0.5),
        )
        .unwrap();

        assert_eq!(with_failure.matches, healthy.matches);
        assert_eq!(with_failure.skipped.fetch_failed, 1);
        assert_eq!(with_failure.candidates_seen, 5);
    }

    #[test]
    fn test_undecodable_and_inference_failures_are_skipped() {
        let embedder = FakeEmbedder::default()
            .with("good", Fixture::Faces(vec![face_at(0.9)]))
            .with("junk", Fixture::Garbage)
            .with("bad", Fixture::Broken);

        let report = match_against_collection(
            &embedder,
            &query(),
            vec![ok("junk"), ok("bad"), ok("good")],
            &cosine(0.5),
        )
        .unwrap();

        assert_eq!(ids(&report), vec!["good"]);
        assert_eq!(report.skipped.invalid_image, 1);
        assert_eq!(report.skipped.inference_failed, 1);
        assert_eq!(report.skipped.total(), 2);
    }

    #[test]
    fn test_model_unavailable_aborts_scan() {
        let embedder = FakeEmbedder::default()
            .with("good", Fixture::Faces(vec![face_at(0.9)]))
            .with("down", Fixture::ModelDown);

        let err = match_against_collection(
            &embedder,
            &query(),
            vec![ok("good"), ok("down"), ok("good")],
            &MatchOptions { prefetch: 2, ..cosine(0.5) },
        )
        .unwrap_err();
        assert!(matches!(err, EmbedError::ModelUnavailable(_)));
    }

    #[test]
    fn test_top_k_keeps_best() {
        let embedder = FakeEmbedder::default()
            .with("a", Fixture::Faces(vec![face_at(0.6)]))
            .with("b", Fixture::Faces(vec![face_at(0.9)]))
            .with("c", Fixture::Faces(vec![face_at(0.7)]));

        let report = match_against_collection(
            &embedder,
            &query(),
            vec![ok("a"), ok("b"), ok("c")],
            &MatchOptions { top_k: Some(1), ..cosine(0.5) },
        )
        .unwrap();

        assert_eq!(ids(&report), vec!["b"]);
    }

    #[test]
    fn test_deadline_stops_scan() {
        let embedder = FakeEmbedder::default().with("a", Fixture::Faces(vec![face_at(0.9)]));
        let options = MatchOptions {
            deadline: Some(Instant::now()),
            ..cosine(0.5)
        };
        std::thread::sleep(Duration::from_millis(2));

        let report = match_against_collection(&embedder, &query(), vec![ok("a"), ok("a")], &options).unwrap();
        assert!(report.deadline_exceeded);
        assert!(report.matches.is_empty());
        assert_eq!(report.candidates_seen, 0);
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let embedder = FakeEmbedder::default().with("a", Fixture::Faces(vec![face_at(0.9)]));
        let report = match_against_collection(&embedder, &[], vec![ok("a")], &cosine(-1.0)).unwrap();
        assert_eq!(report, MatchReport::default());
    }

    #[test]
    fn test_distance_criterion_scan() {
        let embedder = FakeEmbedder::default()
            .with("near", Fixture::Faces(vec![vec![0.9, 0.1]]))
            .with("far", Fixture::Faces(vec![vec![0.0, 1.0]]));
        let options = MatchOptions {
            criterion: MatchCriterion::Distance { max_distance: 0.5 },
            ..Default::default()
        };

        let report = match_against_collection(&embedder, &query(), vec![ok("far"), ok("near")], &options).unwrap();
        assert_eq!(ids(&report), vec!["near"]);
        let expected = 1.0 - 0.02f32.sqrt();
        assert!((report.matches[0].similarity - expected).abs() < 1e-5);
    }

    #[test]
    fn test_verify_pair() {
        let embedder = FakeEmbedder::default()
            .with("selfie", Fixture::Faces(vec![vec![1.0, 0.0]]))
            .with("photo", Fixture::Faces(vec![face_at(0.3), face_at(0.85)]))
            .with("empty", Fixture::Faces(vec![]));
        let criterion = MatchCriterion::Cosine { min_similarity: 0.35 };

        let verdict = verify_pair(&embedder, b"selfie", b"photo", &criterion).unwrap();
        assert!(verdict.matched);
        assert!((verdict.similarity - 0.85).abs() < 1e-5);

        let none = verify_pair(&embedder, b"selfie", b"empty", &criterion).unwrap();
        assert_eq!(none, PairVerdict { matched: false, similarity: 0.0 });

        assert!(matches!(
            verify_pair(&embedder, b"selfie", b"???", &criterion),
            Err(EmbedError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_criterion_serde_tagged() {
        let json = serde_json::to_string(&MatchCriterion::Distance { max_distance: 0.5 }).unwrap();
        assert_eq!(json, r#"{"metric":"distance","max_distance":0.5}"#);
    }
}
