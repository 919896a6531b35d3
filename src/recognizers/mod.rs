//! Text recognizer interface.
//!
//! A recognizer takes one small, already-cropped image and returns the text
//! in it. It knows nothing about templates or pages.

use std::sync::Arc;

use clap::ValueEnum;

use crate::prelude::*;

pub mod echo;
pub mod tesseract;

/// An encoded image to recognize.
#[derive(Clone, Debug)]
pub struct RecognitionImage {
    /// PNG-encoded pixels.
    pub png: Vec<u8>,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

/// What a recognizer found.
#[derive(Clone, Debug, PartialEq)]
pub struct Recognition {
    /// Raw recognized text. Callers trim it.
    pub text: String,

    /// Confidence, from 0 to 100.
    pub confidence: f64,
}

/// Interface to an OCR engine.
#[async_trait]
pub trait TextRecognizer: Send + Sync + 'static {
    /// Recognize the text in `image`.
    ///
    /// Implementations may call `progress` with values in `0.0..=1.0`, never
    /// decreasing.
    async fn recognize(
        &self,
        image: &RecognitionImage,
        language: &str,
        progress: &mut (dyn FnMut(f32) + Send),
    ) -> Result<Recognition>;
}

/// The recognizers we know how to build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum RecognizerType {
    /// Run the `tesseract` command-line tool.
    #[default]
    Tesseract,

    /// Report the size of each crop instead of reading it. Useful for
    /// checking a template without an OCR engine installed.
    Echo,
}

impl RecognizerType {
    /// Instantiate an appropriate recognizer.
    pub fn create_recognizer(&self) -> Result<Arc<dyn TextRecognizer>> {
        match self {
            RecognizerType::Tesseract => {
                Ok(Arc::new(tesseract::TesseractRecognizer::from_env()?))
            }
            RecognizerType::Echo => Ok(Arc::new(echo::EchoRecognizer)),
        }
    }
}
