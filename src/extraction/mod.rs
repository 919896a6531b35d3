//! Applying a template to a batch of pages.
//!
//! The [`Orchestrator`] visits every region of the template on every page,
//! one at a time, and produces exactly one [`ExtractionResult`] per pair.
//! A region that can't be read still gets a result, with empty text, zero
//! confidence and a [`RegionFailure`] explaining what happened.

use std::{collections::HashMap, sync::Arc, time::Duration};

use schemars::JsonSchema;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    errors::ExtractError,
    geometry::{PageRegion, Region},
    pages::PageImage,
    prelude::*,
    recognizers::{Recognition, TextRecognizer},
    template::Template,
};

pub mod crop;

/// Namespace for [`ExtractionResult`] ids.
const RESULT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b9e_4d3a_5e87_a0b4_93c2_1d7e_58f6);

/// The default OCR language.
pub const DEFAULT_LANGUAGE: &str = "eng";

/// The default factor by which crops are enlarged before recognition.
pub const DEFAULT_UPSCALE_FACTOR: u32 = 2;

/// The default pause between recognition calls.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(50);

/// Knobs for an extraction run.
#[derive(Clone, Debug)]
pub struct ExtractionOptions {
    /// Language passed to the recognizer.
    pub language: String,

    /// Crops are enlarged by this factor in each dimension. `1` disables
    /// upscaling.
    pub upscale_factor: u32,

    /// Pause between consecutive recognition calls. [`Duration::ZERO`]
    /// disables throttling.
    pub throttle: Duration,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_owned(),
            upscale_factor: DEFAULT_UPSCALE_FACTOR,
            throttle: DEFAULT_THROTTLE,
        }
    }
}

/// Reported before each recognition call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractionProgress {
    /// 1-based operation number.
    pub op: usize,

    /// Total operations in this run.
    pub total: usize,

    pub page_number: u32,
    pub field_name: String,
    pub source_id: String,

    /// 1-based index of `source_id`, in order of first appearance.
    pub file_index: usize,

    /// Number of distinct documents in this run.
    pub total_files: usize,
}

/// Receives progress notifications. Must not block.
pub trait ProgressSink: Send {
    /// A recognition operation is about to start.
    fn operation_started(&mut self, progress: &ExtractionProgress);

    /// The recognizer reported progress within operation `op`.
    fn recognition_progress(&mut self, _op: usize, _fraction: f32) {}

    /// Operation `op` has a result, whether or not recognition succeeded.
    fn operation_finished(&mut self, _op: usize) {}
}

/// A [`ProgressSink`] which ignores everything.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn operation_started(&mut self, _progress: &ExtractionProgress) {}
}

/// Why a region has no usable text.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionFailureKind {
    /// Cropping, encoding or recognition returned an error.
    RecognitionFailed,

    /// The recognizer returned something we can't represent, such as a
    /// confidence outside `0..=100`.
    UnsupportedRecognizerOutput,
}

/// Diagnostic attached to a result synthesized from a failure.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct RegionFailure {
    pub kind: RegionFailureKind,
    pub message: String,
}

/// The text read from one region of one page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    id: Uuid,
    field_name: String,
    region: PageRegion,
    page_number: u32,
    source_id: String,

    /// Recognized text, trimmed. Empty on failure. May be corrected by a
    /// later review step.
    pub text: String,

    confidence: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<RegionFailure>,
}

impl ExtractionResult {
    pub(crate) fn new(page: &PageImage, region: &Region) -> Self {
        Self {
            id: result_id(&page.source_id, page.page_number, region.id()),
            field_name: region.field_name().to_owned(),
            region: region.on_page(page.page_number),
            page_number: page.page_number,
            source_id: page.source_id.clone(),
            text: String::new(),
            confidence: 0.0,
            failure: None,
        }
    }

    pub(crate) fn recognized(mut self, recognition: Recognition) -> Self {
        self.text = recognition.text.trim().to_owned();
        self.confidence = recognition.confidence;
        self
    }

    fn failed(mut self, kind: RegionFailureKind, message: String) -> Self {
        self.failure = Some(RegionFailure { kind, message });
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn region(&self) -> &PageRegion {
        &self.region
    }

    pub fn page_number(&self) -> u32 {
        self.page_number
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Confidence from 0 to 100.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Set if this result stands in for a region we couldn't read.
    pub fn failure(&self) -> Option<&RegionFailure> {
        self.failure.as_ref()
    }
}

/// Deterministic id for the result of `region_id` on a page.
pub fn result_id(source_id: &str, page_number: u32, region_id: Uuid) -> Uuid {
    let key = json!([source_id, page_number, region_id.to_string()]).to_string();
    Uuid::new_v5(&RESULT_ID_NAMESPACE, key.as_bytes())
}

/// The output of [`Orchestrator::run`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    /// One result per (page, region), pages outermost. A cancelled run holds
    /// a prefix of the full sequence.
    pub results: Vec<ExtractionResult>,

    /// Did we stop early?
    pub cancelled: bool,
}

impl Extraction {
    /// How many results stand in for failures.
    pub fn failure_count(&self) -> usize {
        self.results.iter().filter(|r| r.failure.is_some()).count()
    }
}

/// Runs templates against pages.
pub struct Orchestrator {
    recognizer: Arc<dyn TextRecognizer>,
    options: ExtractionOptions,
    cancel: Option<CancellationToken>,
}

impl Orchestrator {
    pub fn new(recognizer: Arc<dyn TextRecognizer>, options: ExtractionOptions) -> Self {
        Self {
            recognizer,
            options,
            cancel: None,
        }
    }

    /// Stop early when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Apply `template` to every page in `pages`.
    #[instrument(level = "debug", skip_all, fields(template = %template.name(), pages = pages.len()))]
    pub async fn run(
        &self,
        pages: &[PageImage],
        template: &Template,
        progress: &mut dyn ProgressSink,
    ) -> Result<Extraction, ExtractError> {
        let regions = template.regions();
        if regions.is_empty() {
            return Err(ExtractError::EmptyTemplate);
        }
        if pages.is_empty() {
            return Err(ExtractError::NoPages);
        }

        let file_indices = file_indices(pages);
        let total = pages.len() * regions.len();
        let mut extraction = Extraction {
            results: Vec::with_capacity(total),
            cancelled: false,
        };

        let mut op = 0;
        for page in pages {
            for region in regions {
                if op > 0 && !self.throttle().await {
                    extraction.cancelled = true;
                    return Ok(extraction);
                }
                if self.is_cancelled() {
                    extraction.cancelled = true;
                    return Ok(extraction);
                }

                op += 1;
                progress.operation_started(&ExtractionProgress {
                    op,
                    total,
                    page_number: page.page_number,
                    field_name: region.field_name().to_owned(),
                    source_id: page.source_id.clone(),
                    file_index: file_indices[page.source_id.as_str()],
                    total_files: file_indices.len(),
                });
                match self.recognize_region(page, region, op, progress).await {
                    Some(result) => {
                        extraction.results.push(result);
                        progress.operation_finished(op);
                    }
                    None => {
                        extraction.cancelled = true;
                        return Ok(extraction);
                    }
                }
            }
        }

        info!(
            "Extracted {} fields from {} pages ({} failed)",
            extraction.results.len(),
            pages.len(),
            extraction.failure_count(),
        );
        Ok(extraction)
    }

    /// Wait out the throttle delay. Returns `false` if we were cancelled
    /// while waiting.
    async fn throttle(&self) -> bool {
        if self.options.throttle.is_zero() {
            return true;
        }
        let sleep = tokio::time::sleep(self.options.throttle);
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => false,
                _ = sleep => true,
            },
            None => {
                sleep.await;
                true
            }
        }
    }

    /// Read one region of one page. Returns `None` only if cancelled
    /// mid-recognition.
    #[instrument(
        level = "debug",
        skip_all,
        fields(source_id = %page.source_id, page = page.page_number, field = %region.field_name())
    )]
    async fn recognize_region(
        &self,
        page: &PageImage,
        region: &Region,
        op: usize,
        progress: &mut dyn ProgressSink,
    ) -> Option<ExtractionResult> {
        let result = ExtractionResult::new(page, region);
        match self.try_recognize(page, region, op, progress).await {
            Ok(Some(recognition)) => {
                let confidence = recognition.confidence;
                if confidence.is_finite() && (0.0..=100.0).contains(&confidence) {
                    debug!(confidence, "recognized region");
                    Some(result.recognized(recognition))
                } else {
                    warn!(confidence, "recognizer returned an invalid confidence");
                    Some(result.failed(
                        RegionFailureKind::UnsupportedRecognizerOutput,
                        format!("confidence {confidence} is outside 0..=100"),
                    ))
                }
            }
            Ok(None) => None,
            Err(err) => {
                warn!("Could not read region: {:?}", err);
                Some(result.failed(
                    RegionFailureKind::RecognitionFailed,
                    format!("{err:#}"),
                ))
            }
        }
    }

    async fn try_recognize(
        &self,
        page: &PageImage,
        region: &Region,
        op: usize,
        progress: &mut dyn ProgressSink,
    ) -> Result<Option<Recognition>> {
        let image = crop::crop_region(page, region, self.options.upscale_factor).await?;
        let mut relay = |fraction: f32| progress.recognition_progress(op, fraction);
        let recognition = self
            .recognizer
            .recognize(&image, &self.options.language, &mut relay);
        match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Ok(None),
                result = recognition => result.map(Some),
            },
            None => recognition.await.map(Some),
        }
    }
}

/// Map each source id to its 1-based position by first appearance.
fn file_indices(pages: &[PageImage]) -> HashMap<&str, usize> {
    let mut indices = HashMap::new();
    for page in pages {
        let next = indices.len() + 1;
        indices.entry(page.source_id.as_str()).or_insert(next);
    }
    indices
}
