//! Turning documents into page images.
//!
//! Rendering is not our job: we shell out to Poppler for PDFs and let the
//! `image` crate decode everything else. What we _do_ care about is the
//! contract: pages come back numbered from 1, in order, tagged with the
//! document they came from.

use std::{collections::BTreeMap, fmt, sync::Arc, sync::LazyLock};

use clap::{ArgAction, Args, ValueEnum};
use image::DynamicImage;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Image types we decode directly, as a single page.
const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/tiff",
    "image/webp",
    "image/gif",
    "image/bmp",
];

/// PDF MIME type.
const PDF_MIME_TYPE: &str = "application/pdf";

/// PDF user space is 72 units per inch.
const PDF_POINTS_PER_INCH: f32 = 72.0;

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler complains about damaged cross-reference tables that it then
/// repairs. Those aren't real failures.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output report an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// One rendered page.
///
/// The raster is shared, so cloning a page is cheap and nobody can mutate
/// the pixels out from under an extraction run.
#[derive(Clone)]
pub struct PageImage {
    /// 1-based page number within the source document.
    pub page_number: u32,

    /// Which document this page came from.
    pub source_id: String,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,

    /// The rendered page.
    pub pixels: Arc<DynamicImage>,
}

impl PageImage {
    /// Wrap a decoded image as a page.
    pub fn new(source_id: impl Into<String>, page_number: u32, pixels: DynamicImage) -> Self {
        Self {
            page_number,
            source_id: source_id.into(),
            width: pixels.width(),
            height: pixels.height(),
            pixels: Arc::new(pixels),
        }
    }
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("page_number", &self.page_number)
            .field("source_id", &self.source_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Sort pages by document, then by page number.
///
/// Documents keep the relative order of their first page, so callers who
/// render files in a meaningful order don't lose it.
pub fn sort_pages_by_document(pages: &mut [PageImage]) {
    let mut first_seen = BTreeMap::new();
    for (idx, page) in pages.iter().enumerate() {
        first_seen.entry(page.source_id.clone()).or_insert(idx);
    }
    pages.sort_by_key(|p| (first_seen[&p.source_id], p.page_number));
}

/// Raster format used when rendering PDFs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RenderFormat {
    #[default]
    Png,
    Jpeg,
}

/// Options for rendering documents into pages.
#[derive(Args, Clone, Debug)]
pub struct RenderOptions {
    /// Render scale for PDFs, where 1.0 is 72 DPI. Region coordinates in the
    /// template must have been drawn at the same scale.
    #[clap(long, default_value = "2.0")]
    pub scale: f32,

    /// JPEG quality (1-100), used with `--format jpeg`.
    #[clap(long, default_value = "90", value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: u8,

    /// Raster format for rendered PDF pages.
    #[clap(long, value_enum, default_value_t = RenderFormat::default())]
    pub format: RenderFormat,

    /// Disable antialiasing when rendering PDFs.
    #[clap(long = "no-antialias", action = ArgAction::SetFalse)]
    pub antialiasing: bool,

    /// Only render the first N pages of each document.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale: 2.0,
            quality: 90,
            format: RenderFormat::Png,
            antialiasing: true,
            max_pages: None,
        }
    }
}

impl RenderOptions {
    /// The resolution to ask Poppler for.
    fn dpi(&self) -> u32 {
        (self.scale * PDF_POINTS_PER_INCH).round().max(1.0) as u32
    }
}

/// A document to render.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DocumentInput {
    /// Where the document lives.
    pub path: PathBuf,

    /// Identifier used to group pages. Defaults to the file name.
    #[serde(default)]
    pub source_id: Option<String>,

    /// Password for encrypted PDFs.
    #[serde(default)]
    pub password: Option<String>,
}

impl DocumentInput {
    /// Describe a document by path alone.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source_id: None,
            password: None,
        }
    }

    /// The identifier we'll tag this document's pages with.
    pub fn source_id(&self) -> String {
        match &self.source_id {
            Some(id) => id.clone(),
            None => self
                .path
                .file_name()
                .unwrap_or(self.path.as_os_str())
                .to_string_lossy()
                .into_owned(),
        }
    }
}

/// Something that can turn a document into page images.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Render every page of `document`, numbered from 1.
    async fn render(
        &self,
        document: &DocumentInput,
        options: &RenderOptions,
    ) -> Result<Vec<PageImage>>;
}

/// Renders PDFs with Poppler's `pdftocairo`, and decodes images directly.
#[derive(Debug, Default)]
pub struct PopplerRenderer;

#[async_trait]
impl PageRenderer for PopplerRenderer {
    #[instrument(level = "debug", skip_all, fields(path = %document.path.display()))]
    async fn render(
        &self,
        document: &DocumentInput,
        options: &RenderOptions,
    ) -> Result<Vec<PageImage>> {
        let source_id = document.source_id();
        let mime_type = get_mime_type(&document.path)?;
        // Hold on to any temporary directory until we've decoded every page.
        let (_tmpdir, paths) = if SUPPORTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
            (None, vec![document.path.clone()])
        } else if mime_type == PDF_MIME_TYPE {
            let (tmpdir, rendered) = rasterize_pdf(document, options).await?;
            (Some(tmpdir), rendered)
        } else {
            return Err(anyhow!(
                "unsupported MIME type {} for {:?} (supported: PNG, JPEG, TIFF, WebP, GIF, BMP, PDF)",
                mime_type,
                document.path.display()
            ));
        };

        let mut pages = Vec::with_capacity(paths.len());
        for (idx, path) in paths.into_iter().enumerate() {
            let pixels = spawn_blocking_propagating_panics(move || {
                image::open(&path)
                    .with_context(|| format!("failed to decode page image {:?}", path.display()))
            })
            .await?;
            let page_number = u32::try_from(idx + 1).context("too many pages")?;
            pages.push(PageImage::new(source_id.clone(), page_number, pixels));
        }
        debug!(source_id = %source_id, pages = pages.len(), "Rendered document");
        Ok(pages)
    }
}

/// Rasterize a PDF into a temporary directory, returning the page files in
/// page order.
#[instrument(level = "debug", skip_all, fields(path = %document.path.display()))]
async fn rasterize_pdf(
    document: &DocumentInput,
    options: &RenderOptions,
) -> Result<(tempfile::TempDir, Vec<PathBuf>)> {
    let path = &document.path;
    let password = document.password.as_deref();
    let total_pages = get_pdf_page_count(path, password).await?;
    let filename = path
        .file_stem()
        .context("failed to get filename from PDF path")?;

    let tmpdir = tempfile::TempDir::with_prefix("pages")?;
    // pdftocairo appends zero-padded page numbers to this prefix.
    let out_prefix = tmpdir.path().join(filename);

    let max_pages = options.max_pages.filter(|&max_pages| total_pages > max_pages);
    if let Some(max_pages) = max_pages {
        warn!(
            path = %path.display(),
            "Only rendering {}/{} pages (because of --max-pages)",
            max_pages,
            total_pages
        );
    }
    let mut cmd = Command::new("pdftocairo");
    cmd.args(pdftocairo_args(options, password, max_pages));

    // `pdftocairo` will happily use a whole core, so don't run hundreds.
    let output = with_cpu_semaphore(|| async {
        cmd.arg(path)
            .arg(&out_prefix)
            .output()
            .await
            .with_context(|| format!("failed to run pdftocairo on {:?}", path.display()))
    })
    .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

    let tmpdir_path = tmpdir.path();
    let mut paths = tmpdir_path
        .read_dir()
        .with_context(|| {
            format!(
                "failed to read temporary directory {:?}",
                tmpdir_path.display()
            )
        })?
        .map(|entry| {
            let entry = entry.with_context(|| {
                format!(
                    "failed to read entry in temporary directory {:?}",
                    tmpdir_path.display()
                )
            })?;
            Ok(entry.path())
        })
        .collect::<Result<Vec<_>>>()?;
    paths.sort();
    Ok((tmpdir, paths))
}

/// Options for `pdftocairo`, not including the input and output paths.
fn pdftocairo_args(
    options: &RenderOptions,
    password: Option<&str>,
    last_page: Option<usize>,
) -> Vec<String> {
    let mut args = vec![];
    match options.format {
        RenderFormat::Png => args.push("-png".to_owned()),
        RenderFormat::Jpeg => {
            args.push("-jpeg".to_owned());
            args.push("-jpegopt".to_owned());
            args.push(format!("quality={}", options.quality));
        }
    }
    args.push("-r".to_owned());
    args.push(options.dpi().to_string());
    if !options.antialiasing {
        args.push("-antialias".to_owned());
        args.push("none".to_owned());
    }
    args.extend(password_args(password));
    if let Some(last_page) = last_page {
        // Poppler page ranges are 1-based and inclusive.
        args.push("-l".to_owned());
        args.push(last_page.to_string());
    }
    args
}

/// Poppler password options. We don't know which kind of password we were
/// given, so we offer it as both.
fn password_args(password: Option<&str>) -> Vec<String> {
    match password {
        Some(password) => ["-opw", password, "-upw", password]
            .into_iter()
            .map(str::to_owned)
            .collect(),
        None => vec![],
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path, password: Option<&str>) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .args(password_args(password))
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output).with_context(|| {
        format!(
            "failed to find page count for {:?} in pdfinfo output",
            path.display()
        )
    })
}

/// Pull the `Pages:` value out of `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let value = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "Pages")
        .map(|(_, value)| value.trim())
        .ok_or_else(|| anyhow!("no Pages entry"))?;
    value
        .parse::<usize>()
        .with_context(|| format!("invalid page count {value:?}"))
}

/// Get the MIME type of a file by sniffing its contents.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}
