//! The `extract` subcommand.

use std::time::Duration;

use chrono::Local;
use clap::Args;
use tokio_util::sync::CancellationToken;

use crate::{
    async_utils::io::{read_records, write_text_output},
    export::{CsvMode, default_export_filename, to_csv},
    extraction::{
        DEFAULT_LANGUAGE, DEFAULT_UPSCALE_FACTOR, ExtractionOptions, Orchestrator,
    },
    pages::{
        DocumentInput, PageImage, PageRenderer, PopplerRenderer, RenderOptions,
        sort_pages_by_document,
    },
    prelude::*,
    recognizers::RecognizerType,
    template::Template,
    ui::{ProgressBarSink, ProgressConfig, Ui},
};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The template to apply, as saved by `template new`.
    #[clap(long)]
    pub template: PathBuf,

    /// A CSV or JSONL file listing documents, with a `path` column and
    /// optional `source_id` and `password` columns. Use `-` for stdin.
    #[clap(long)]
    pub manifest: Option<PathBuf>,

    /// PDFs or images to extract from, processed after any manifest entries.
    #[clap(value_name = "DOC")]
    pub documents: Vec<PathBuf>,

    /// What kind of CSV to write.
    #[clap(long, value_enum, default_value_t = CsvMode::default())]
    pub mode: CsvMode,

    /// The OCR engine to use.
    #[clap(long, value_enum, default_value_t = RecognizerType::default())]
    pub engine: RecognizerType,

    /// OCR language code.
    #[clap(long, default_value = DEFAULT_LANGUAGE)]
    pub lang: String,

    /// Enlarge each crop by this factor before OCR.
    #[clap(
        long,
        default_value_t = DEFAULT_UPSCALE_FACTOR,
        value_parser = clap::value_parser!(u32).range(1..=8)
    )]
    pub upscale: u32,

    /// Milliseconds to wait between OCR calls.
    #[clap(long, default_value = "50")]
    pub throttle_ms: u64,

    #[clap(flatten)]
    pub render: RenderOptions,

    /// Keep all pages with the same source id together, even when the
    /// manifest lists that document's files apart.
    #[clap(long)]
    pub sort_pages: bool,

    /// What portion of fields should we allow to fail? Specified as a number
    /// between 0.0 and 1.0. Results are written either way.
    #[clap(long, default_value = "1.0", value_parser = parse_failure_rate)]
    pub allowed_failure_rate: f32,

    /// Write the CSV to this file.
    #[clap(short = 'o', long = "out", conflicts_with = "out_dir")]
    pub output_path: Option<PathBuf>,

    /// Write the CSV to this directory, using the default file name for
    /// the mode and today's date.
    #[clap(long)]
    pub out_dir: Option<PathBuf>,
}

impl ExtractOpts {
    /// Are we writing our CSV to stdout?
    pub fn using_stdout_for_output(&self) -> bool {
        self.output_path.is_none() && self.out_dir.is_none()
    }

    /// Where the CSV goes, or `None` for stdout.
    fn resolved_output_path(&self) -> Option<PathBuf> {
        match (&self.output_path, &self.out_dir) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(dir)) => Some(dir.join(default_export_filename(
                self.mode,
                Local::now().date_naive(),
            ))),
            (None, None) => None,
        }
    }

    fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            language: self.lang.clone(),
            upscale_factor: self.upscale,
            throttle: Duration::from_millis(self.throttle_ms),
        }
    }
}

/// Parse a failure rate, which must be between 0.0 and 1.0.
fn parse_failure_rate(s: &str) -> Result<f32> {
    let rate = s
        .parse::<f32>()
        .with_context(|| format!("invalid failure rate {s:?}"))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(anyhow!("failure rate {rate} must be between 0.0 and 1.0"));
    }
    Ok(rate)
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let template = Template::load(&opts.template).await?;

    // Collect our documents.
    let mut documents = match &opts.manifest {
        Some(path) => read_records::<DocumentInput>(path).await?,
        None => vec![],
    };
    documents.extend(
        opts.documents
            .iter()
            .map(|path| DocumentInput::from_path(path.clone())),
    );
    if documents.is_empty() {
        return Err(anyhow!(
            "no documents to extract from (pass files or --manifest)"
        ));
    }

    let mut pages = render_documents(&ui, &documents, &opts.render).await?;
    if opts.sort_pages {
        sort_pages_by_document(&mut pages);
    }

    // Cancel on Ctrl-C, keeping whatever we've already read.
    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, writing partial results");
                cancel.cancel();
            }
        }
    });

    let recognizer = opts.engine.create_recognizer()?;
    let orchestrator = Orchestrator::new(recognizer, opts.extraction_options())
        .with_cancellation(cancel);
    let mut sink = ProgressBarSink::new(&ui);
    let extraction = orchestrator.run(&pages, &template, &mut sink).await;
    ctrl_c.abort();
    let extraction = extraction?;

    let output_path = opts.resolved_output_path();
    write_text_output(output_path.as_deref(), &to_csv(&extraction.results, opts.mode))
        .await?;
    if let Some(path) = &output_path {
        ui.display_message("💾", &format!("Wrote {}", path.display()));
    }

    // Report how it went.
    let total = extraction.results.len();
    let failures = extraction.failure_count();
    if failures > 0 {
        ui.display_message(
            "⚠️",
            &format!("{failures} of {total} fields could not be read"),
        );
    }
    if extraction.cancelled {
        return Err(anyhow!(
            "extraction was cancelled after {total} of {} fields",
            pages.len() * template.regions().len()
        ));
    }
    let failure_rate = if total == 0 {
        0.0
    } else {
        failures as f32 / total as f32
    };
    if failure_rate > opts.allowed_failure_rate {
        return Err(anyhow!(
            "failure rate {:.1}% exceeds allowed failure rate {:.1}%",
            failure_rate * 100.0,
            opts.allowed_failure_rate * 100.0
        ));
    }
    Ok(())
}

/// Render every document to pages, in order.
#[instrument(level = "debug", skip_all, fields(documents = documents.len()))]
async fn render_documents(
    ui: &Ui,
    documents: &[DocumentInput],
    render_opts: &RenderOptions,
) -> Result<Vec<PageImage>> {
    let renderer = PopplerRenderer;
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Rendering documents",
            done_msg: "Rendered documents",
        },
        documents.len() as u64,
    );
    let mut pages = vec![];
    for document in documents {
        let rendered = renderer
            .render(document, render_opts)
            .await
            .with_context(|| format!("could not render {:?}", document.path.display()))?;
        pages.extend(rendered);
        pb.inc(1);
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_must_be_a_fraction() {
        assert_eq!(parse_failure_rate("0").unwrap(), 0.0);
        assert_eq!(parse_failure_rate("0.25").unwrap(), 0.25);
        assert_eq!(parse_failure_rate("1.0").unwrap(), 1.0);
        assert!(parse_failure_rate("-0.1").is_err());
        assert!(parse_failure_rate("1.5").is_err());
        assert!(parse_failure_rate("NaN").is_err());
        assert!(parse_failure_rate("half").is_err());
    }
}
