//! Echo recognizer for testing.
//!
//! Instead of reading text, this reports the dimensions of the image it was
//! given, as `{width}x{height}`, with full confidence. That's enough to check
//! that a template lands where you expect and that crops are upscaled.

use crate::prelude::*;

use super::{Recognition, RecognitionImage, TextRecognizer};

/// Echo recognizer for testing.
#[derive(Debug, Default)]
pub struct EchoRecognizer;

#[async_trait]
impl TextRecognizer for EchoRecognizer {
    async fn recognize(
        &self,
        image: &RecognitionImage,
        _language: &str,
        progress: &mut (dyn FnMut(f32) + Send),
    ) -> Result<Recognition> {
        if image.png.is_empty() {
            return Err(anyhow!("Echo recognizer received an empty image"));
        }
        progress(1.0);
        Ok(Recognition {
            text: format!("{}x{}", image.width, image.height),
            confidence: 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_dimensions_and_reports_progress() {
        let image = RecognitionImage {
            png: vec![0x89],
            width: 200,
            height: 80,
        };
        let mut seen = vec![];
        let recognition = EchoRecognizer
            .recognize(&image, "eng", &mut |p| seen.push(p))
            .await
            .unwrap();
        assert_eq!(recognition.text, "200x80");
        assert_eq!(recognition.confidence, 100.0);
        assert_eq!(seen, [1.0]);
    }

    #[tokio::test]
    async fn empty_image_is_an_error() {
        let image = RecognitionImage {
            png: vec![],
            width: 0,
            height: 0,
        };
        assert!(EchoRecognizer.recognize(&image, "eng", &mut |_| {}).await.is_err());
    }
}
