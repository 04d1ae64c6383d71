//! Face embedder: image bytes in, one embedding per detected face out.
//!
//! [`FaceEmbedder`] is the seam the matcher depends on. [`OnnxFaceEmbedder`]
//! is the production implementation (SCRFD + ArcFace); tests substitute
//! their own.

use crate::alignment;
use crate::detector::{DetectorError, DetectorSettings, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, FaceDetection};
use image::RgbImage;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EmbedError {
    /// The bytes are not a decodable image.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// A model could not be loaded or initialized.
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    /// A loaded model failed while processing this image.
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<DetectorError> for EmbedError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::ModelNotFound(path) => Self::ModelUnavailable(format!("detector model not found: {path}")),
            other => Self::Inference(format!("detector: {other}")),
        }
    }
}

impl From<RecognizerError> for EmbedError {
    fn from(err: RecognizerError) -> Self {
        match err {
            RecognizerError::ModelNotFound(path) => Self::ModelUnavailable(format!("recognizer model not found: {path}")),
            other => Self::Inference(format!("recognizer: {other}")),
        }
    }
}

/// Detects faces and computes one embedding per face.
///
/// Implementations must be safe to share across threads; an image with no
/// faces yields `Ok(vec![])`.
pub trait FaceEmbedder: Send + Sync {
    fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<FaceDetection>, EmbedError>;
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Arc<E> {
    fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<FaceDetection>, EmbedError> {
        (**self).detect_and_embed(image)
    }
}

/// Decode image bytes (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, EmbedError> {
    let image = image::load_from_memory(bytes).map_err(|e| EmbedError::InvalidImage(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(EmbedError::InvalidImage("image has zero size".into()));
    }
    Ok(image.to_rgb8())
}

/// Locations of the two ONNX model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPaths {
    /// Standard InsightFace file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(SCRFD_MODEL_FILE),
            recognizer: dir.join(ARCFACE_MODEL_FILE),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedderSettings {
    pub detector: DetectorSettings,
    /// Keep only the N most confident faces per image.
    pub max_faces: Option<usize>,
}

/// SCRFD + ArcFace embedder. One mutex per ONNX session.
pub struct OnnxFaceEmbedder {
    detector: Mutex<FaceDetector>,
    recognizer: Mutex<FaceRecognizer>,
    max_faces: Option<usize>,
}

impl OnnxFaceEmbedder {
    /// Load both models. Any failure is reported as `ModelUnavailable`.
    pub fn load(paths: &ModelPaths, settings: EmbedderSettings) -> Result<Self, EmbedError> {
        let detector_path = paths.detector.to_string_lossy();
        let recognizer_path = paths.recognizer.to_string_lossy();

        let detector = FaceDetector::load(&detector_path, settings.detector)
            .map_err(|e| EmbedError::ModelUnavailable(format!("SCRFD ({detector_path}): {e}")))?;
        let recognizer = FaceRecognizer::load(&recognizer_path)
            .map_err(|e| EmbedError::ModelUnavailable(format!("ArcFace ({recognizer_path}): {e}")))?;

        tracing::info!(
            detector = %detector_path,
            recognizer = %recognizer_path,
            max_faces = ?settings.max_faces,
            "face embedder ready"
        );

        Ok(Self {
            detector: Mutex::new(detector),
            recognizer: Mutex::new(recognizer),
            max_faces: settings.max_faces,
        })
    }
}

/// Keep the `max_faces` most confident faces and cut each one out as a
/// 112x112 recognizer input. Faces without landmarks fall back to a bbox crop.
fn face_crops(
    rgb: &RgbImage,
    mut faces: Vec<BoundingBox>,
    max_faces: Option<usize>,
) -> Vec<(BoundingBox, RgbImage)> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    if let Some(max) = max_faces {
        faces.truncate(max);
    }
    faces
        .into_iter()
        .map(|bbox| {
            let crop = match &bbox.landmarks {
                Some(landmarks) => alignment::align_face(rgb, landmarks),
                None => alignment::crop_face(rgb, &bbox),
            };
            (bbox, crop)
        })
        .collect()
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn detect_and_embed(&self, image: &[u8]) -> Result<Vec<FaceDetection>, EmbedError> {
        let rgb = decode_image(image)?;

        let faces = self.detector.lock().detect(&rgb)?;
        let crops = face_crops(&rgb, faces, self.max_faces);
        if crops.is_empty() {
            tracing::debug!(width = rgb.width(), height = rgb.height(), "no face detected");
            return Ok(Vec::new());
        }

        let mut recognizer = self.recognizer.lock();
        let mut detections = Vec::with_capacity(crops.len());
        for (bbox, crop) in crops {
            let embedding = recognizer.extract(&crop)?;
            detections.push(FaceDetection { bbox, embedding });
        }

        tracing::debug!(faces = detections.len(), "embedded faces");
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([200, 150, 100]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_image_png() {
        let rgb = decode_image(&png_bytes(4, 3)).unwrap();
        assert_eq!(rgb.dimensions(), (4, 3));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([200, 150, 100]));
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, EmbedError::InvalidImage(_)));
    }

    #[test]
    fn test_decode_image_rejects_empty() {
        assert!(matches!(decode_image(&[]), Err(EmbedError::InvalidImage(_))));
    }

    #[test]
    fn test_model_paths_in_dir() {
        let paths = ModelPaths::in_dir(Path::new("/opt/models"));
        assert_eq!(paths.detector, PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(paths.recognizer, PathBuf::from("/opt/models/w600k_r50.onnx"));
    }

    #[test]
    fn test_load_missing_models_is_unavailable() {
        let paths = ModelPaths::in_dir(Path::new("/nonexistent/facefindr/models"));
        let err = OnnxFaceEmbedder::load(&paths, EmbedderSettings::default())
            .err()
            .expect("loading from a missing directory must fail");
        assert!(matches!(err, EmbedError::ModelUnavailable(_)), "got {err:?}");
    }

    #[test]
    fn test_detector_errors_map_to_taxonomy() {
        let missing: EmbedError = DetectorError::ModelNotFound("x.onnx".into()).into();
        assert!(matches!(missing, EmbedError::ModelUnavailable(_)));

        let failed: EmbedError = DetectorError::InferenceFailed("boom".into()).into();
        assert!(matches!(failed, EmbedError::Inference(_)));
    }

    fn face(x: f32, confidence: f32, landmarks: Option<[(f32, f32); 5]>) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 112.0,
            height: 112.0,
            confidence,
            landmarks,
        }
    }

    /// Left 112 columns red, right 112 columns blue.
    fn two_tone() -> RgbImage {
        RgbImage::from_fn(224, 112, |x, _| {
            if x < 112 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        })
    }

    #[test]
    fn test_face_crops_cap_keeps_most_confident() {
        let rgb = two_tone();
        let faces = vec![face(0.0, 0.6, None), face(112.0, 0.9, None), face(50.0, 0.7, None)];

        let crops = face_crops(&rgb, faces.clone(), Some(1));
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].0.confidence, 0.9);

        let all = face_crops(&rgb, faces, None);
        let confidences: Vec<f32> = all.iter().map(|(b, _)| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7, 0.6]);
    }

    #[test]
    fn test_face_crops_without_landmarks_uses_bbox() {
        let rgb = two_tone();
        let crops = face_crops(&rgb, vec![face(112.0, 0.8, None)], None);
        let (_, crop) = &crops[0];
        assert_eq!(crop.dimensions(), (112, 112));
        assert_eq!(crop.get_pixel(56, 56), &Rgb([0, 0, 255]));
    }

    #[test]
    fn test_face_crops_with_landmarks_aligns() {
        let rgb = two_tone();
        // Landmarks already at the canonical positions: identity alignment
        // over the red half, even though the bbox points at the blue half.
        let landmarks = alignment::REFERENCE_LANDMARKS_112;
        let crops = face_crops(&rgb, vec![face(112.0, 0.8, Some(landmarks))], None);
        let (bbox, crop) = &crops[0];
        assert!(bbox.landmarks.is_some());
        assert_eq!(crop.dimensions(), (112, 112));
        assert_eq!(crop.get_pixel(56, 56), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_face_crops_empty() {
        assert!(face_crops(&two_tone(), Vec::new(), Some(3)).is_empty());
    }
}
