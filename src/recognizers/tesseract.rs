//! Tesseract OCR recognizer.

use std::{env, time::Duration};

use tokio::{process::Command, time};

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

use super::{Recognition, RecognitionImage, TextRecognizer};

/// How long we give a single crop before giving up.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Page segmentation mode 6: "assume a single uniform block of text", which
/// suits a crop around one field much better than full-page layout analysis.
const PAGE_SEGMENTATION_MODE: &str = "6";

/// Recognizer wrapping the `tesseract` CLI tool.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    /// The command to run.
    command: String,

    /// Per-crop timeout.
    timeout: Duration,
}

impl TesseractRecognizer {
    /// Create a recognizer, honoring `TESSERACT_CMD` and
    /// `TESSERACT_TIMEOUT_SECS` if set.
    pub fn from_env() -> Result<Self> {
        let command = env::var("TESSERACT_CMD").unwrap_or_else(|_| "tesseract".to_owned());
        let timeout = match env::var("TESSERACT_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("invalid TESSERACT_TIMEOUT_SECS {secs:?}"))?,
            ),
            Err(_) => DEFAULT_TIMEOUT,
        };
        Ok(Self { command, timeout })
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    #[instrument(level = "debug", skip_all, fields(width = image.width, height = image.height))]
    async fn recognize(
        &self,
        image: &RecognitionImage,
        language: &str,
        progress: &mut (dyn FnMut(f32) + Send),
    ) -> Result<Recognition> {
        progress(0.0);

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, &image.png)
            .await
            .context("cannot write tesseract input file")?;

        // Run tesseract, asking for TSV on stdout so we get word confidences.
        let mut cmd = Command::new(&self.command);
        cmd.arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .arg("--psm")
            .arg(PAGE_SEGMENTATION_MODE)
            .arg("tsv")
            .kill_on_drop(true);
        let output = with_cpu_semaphore(|| async {
            time::timeout(self.timeout, cmd.output())
                .await
                .map_err(|_| anyhow!("tesseract timed out after {:?}", self.timeout))?
                .with_context(|| format!("cannot run {}", self.command))
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        let tsv = String::from_utf8(output.stdout).context("tesseract output was not UTF-8")?;
        let recognition = parse_tsv(&tsv)?;
        progress(1.0);
        Ok(recognition)
    }
}

/// Reassemble text and mean word confidence from Tesseract's TSV output.
///
/// Words on the same line are joined with spaces, and lines with newlines.
fn parse_tsv(tsv: &str) -> Result<Recognition> {
    let mut lines = tsv.lines();
    let header = lines.next().ok_or_else(|| anyhow!("empty tesseract output"))?;
    let columns = header.split('\t').collect::<Vec<_>>();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| anyhow!("tesseract output has no {name:?} column"))
    };
    let (level_col, block_col, par_col, line_col, conf_col, text_col) = (
        column("level")?,
        column("block_num")?,
        column("par_num")?,
        column("line_num")?,
        column("conf")?,
        column("text")?,
    );

    let mut text = String::new();
    let mut current_line = None;
    let mut confidences = vec![];
    for row in lines {
        let cells = row.split('\t').collect::<Vec<_>>();
        // Only level 5 rows are words.
        if cells.get(level_col) != Some(&"5") {
            continue;
        }
        let word = cells.get(text_col).copied().unwrap_or_default().trim();
        let conf = cells
            .get(conf_col)
            .and_then(|c| c.trim().parse::<f64>().ok())
            .ok_or_else(|| anyhow!("bad tesseract TSV row: {row:?}"))?;
        if word.is_empty() || conf < 0.0 {
            continue;
        }
        let line_key = (
            cells.get(block_col).copied(),
            cells.get(par_col).copied(),
            cells.get(line_col).copied(),
        );
        match current_line {
            Some(key) if key == line_key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(line_key);
        text.push_str(word);
        confidences.push(conf);
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    };
    Ok(Recognition { text, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn parses_words_lines_and_confidence() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t200\t80\t-1\t\n\
             4\t1\t1\t1\t1\t0\t0\t0\t200\t40\t-1\t\n\
             5\t1\t1\t1\t1\t1\t2\t2\t50\t20\t90.5\tP-101\n\
             5\t1\t1\t1\t1\t2\t60\t2\t50\t20\t80.5\tFeed\n\
             5\t1\t1\t1\t2\t1\t2\t40\t50\t20\t70\tPump\n"
        );
        let recognition = parse_tsv(&tsv).unwrap();
        assert_eq!(recognition.text, "P-101 Feed\nPump");
        assert!((recognition.confidence - 80.333).abs() < 0.01);
    }

    #[test]
    fn no_words_means_empty_text_and_zero_confidence() {
        let tsv = format!("{HEADER}\n1\t1\t0\t0\t0\t0\t0\t0\t200\t80\t-1\t\n");
        let recognition = parse_tsv(&tsv).unwrap();
        assert_eq!(recognition.text, "");
        assert_eq!(recognition.confidence, 0.0);
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(parse_tsv("").is_err());
        assert!(parse_tsv("hello world\n").is_err());
        let tsv = format!("{HEADER}\n5\t1\t1\t1\t1\t1\t0\t0\t1\t1\tNaNish\tword\n");
        assert!(parse_tsv(&tsv).is_err());
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn recognizes_blank_image() -> Result<()> {
        let mut png = vec![];
        image::DynamicImage::new_rgb8(80, 40)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)?;
        let image = RecognitionImage {
            png,
            width: 80,
            height: 40,
        };
        let recognizer = TesseractRecognizer::from_env()?;
        let recognition = recognizer.recognize(&image, "eng", &mut |_| {}).await?;
        assert!(recognition.confidence >= 0.0);
        Ok(())
    }
}
