//! Writing extraction results as CSV.
//!
//! We build the CSV by hand instead of using a CSV writer because the output
//! format is fixed: empty text is always written as `""`, and grouped output
//! contains blank separator lines, neither of which a general-purpose writer
//! will produce.

use std::{borrow::Cow, collections::BTreeMap};

use chrono::NaiveDate;
use clap::ValueEnum;

use crate::extraction::ExtractionResult;

/// Which table to produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum CsvMode {
    /// Every result with its confidence and region geometry.
    #[default]
    Full,

    /// Field name, text and page number only.
    Summary,

    /// Results bucketed by page number, with a blank line between pages.
    GroupedByPage,
}

impl CsvMode {
    fn header(self) -> &'static [&'static str] {
        match self {
            CsvMode::Full => &[
                "Field Name",
                "Extracted Text",
                "Page Number",
                "Confidence Score (%)",
                "Position X",
                "Position Y",
                "Width",
                "Height",
                "Selection Type",
            ],
            CsvMode::Summary => &["Field Name", "Extracted Text", "Page Number"],
            CsvMode::GroupedByPage => &[
                "Page Number",
                "Field Name",
                "Extracted Text",
                "Confidence Score (%)",
            ],
        }
    }

    fn file_suffix(self) -> &'static str {
        match self {
            CsvMode::Full => "",
            CsvMode::Summary => "-summary",
            CsvMode::GroupedByPage => "-by-page",
        }
    }
}

/// Render `results` as CSV.
pub fn to_csv(results: &[ExtractionResult], mode: CsvMode) -> String {
    let mut out = String::new();
    push_row(
        &mut out,
        mode.header().iter().map(|h| Cow::Borrowed(*h)).collect(),
    );

    match mode {
        CsvMode::Full => {
            for result in results {
                let region = &result.region().region;
                push_row(
                    &mut out,
                    vec![
                        escape(result.field_name()),
                        text_cell(&result.text),
                        Cow::Owned(result.page_number().to_string()),
                        round_cell(result.confidence()),
                        round_cell(region.x()),
                        round_cell(region.y()),
                        round_cell(region.width()),
                        round_cell(region.height()),
                        Cow::Owned(region.shape().to_string()),
                    ],
                );
            }
        }
        CsvMode::Summary => {
            for result in results {
                push_row(
                    &mut out,
                    vec![
                        escape(result.field_name()),
                        text_cell(&result.text),
                        Cow::Owned(result.page_number().to_string()),
                    ],
                );
            }
        }
        CsvMode::GroupedByPage => {
            let mut buckets = BTreeMap::<u32, Vec<&ExtractionResult>>::new();
            for result in results {
                buckets.entry(result.page_number()).or_default().push(result);
            }
            for (i, (page_number, bucket)) in buckets.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                for (j, result) in bucket.iter().enumerate() {
                    let page_cell = if j == 0 {
                        Cow::Owned(page_number.to_string())
                    } else {
                        Cow::Borrowed("")
                    };
                    push_row(
                        &mut out,
                        vec![
                            page_cell,
                            escape(result.field_name()),
                            text_cell(&result.text),
                            round_cell(result.confidence()),
                        ],
                    );
                }
            }
        }
    }
    out
}

/// The file name a results export would normally be saved as.
pub fn default_export_filename(mode: CsvMode, date: NaiveDate) -> String {
    format!(
        "extraction-results-{}{}.csv",
        date.format("%Y-%m-%d"),
        mode.file_suffix()
    )
}

fn push_row(out: &mut String, cells: Vec<Cow<'_, str>>) {
    out.push_str(&cells.join(","));
    out.push('\n');
}

/// Quote a cell iff it contains a comma, quote or line break.
fn escape(cell: &str) -> Cow<'_, str> {
    if cell.contains([',', '"', '\r', '\n']) {
        Cow::Owned(format!("\"{}\"", cell.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(cell)
    }
}

/// Extracted text is escaped like any other cell, but empty text is always
/// written as `""`.
fn text_cell(text: &str) -> Cow<'_, str> {
    if text.is_empty() {
        Cow::Borrowed("\"\"")
    } else {
        escape(text)
    }
}

fn round_cell(value: f64) -> Cow<'static, str> {
    Cow::Owned(format!("{}", value.round() as i64))
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;
    use crate::{
        geometry::{Shape, create_region},
        pages::PageImage,
        recognizers::Recognition,
    };

    fn result(field: &str, page_number: u32, text: &str, confidence: f64) -> ExtractionResult {
        let region =
            create_region(Shape::Rectangle, (10.4, 20.6), (110.5, 60.0), field).unwrap();
        let page = PageImage::new("doc.pdf", page_number, DynamicImage::new_rgb8(1, 1));
        ExtractionResult::new(&page, &region).recognized(Recognition {
            text: text.to_owned(),
            confidence,
        })
    }

    #[test]
    fn full_mode_rounds_numbers_and_names_shapes() {
        let ellipse =
            create_region(Shape::Ellipse, (0.0, 0.0), (50.0, 50.0), "Seal").unwrap();
        let page = PageImage::new("doc.pdf", 2, DynamicImage::new_rgb8(1, 1));
        let results = [
            result("Tag", 1, "P-101", 91.6),
            ExtractionResult::new(&page, &ellipse),
        ];
        assert_eq!(
            to_csv(&results, CsvMode::Full),
            "Field Name,Extracted Text,Page Number,Confidence Score (%),Position X,Position Y,Width,Height,Selection Type\n\
             Tag,P-101,1,92,10,21,100,39,rectangle\n\
             Seal,\"\",2,0,0,0,50,50,ellipse\n"
        );
    }

    #[test]
    fn summary_mode() {
        let results = [result("Tag", 1, "P-101", 90.0), result("Tag", 2, "", 0.0)];
        assert_eq!(
            to_csv(&results, CsvMode::Summary),
            "Field Name,Extracted Text,Page Number\nTag,P-101,1\nTag,\"\",2\n"
        );
    }

    #[test]
    fn header_only_for_no_results() {
        assert_eq!(
            to_csv(&[], CsvMode::Summary),
            "Field Name,Extracted Text,Page Number\n"
        );
        assert_eq!(
            to_csv(&[], CsvMode::GroupedByPage),
            "Page Number,Field Name,Extracted Text,Confidence Score (%)\n"
        );
    }

    #[test]
    fn grouped_mode_buckets_pages_in_order() {
        let results = [
            result("A", 2, "a", 80.0),
            result("B", 1, "b", 70.0),
            result("C", 2, "c", 60.0),
        ];
        assert_eq!(
            to_csv(&results, CsvMode::GroupedByPage),
            "Page Number,Field Name,Extracted Text,Confidence Score (%)\n\
             1,B,b,70\n\
             \n\
             2,A,a,80\n\
             ,C,c,60\n"
        );
    }

    #[test]
    fn awkward_text_is_quoted() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("two\nlines"), "\"two\nlines\"");
        assert_eq!(escape("cr\rhere"), "\"cr\rhere\"");
        assert_eq!(text_cell(""), "\"\"");
    }

    #[test]
    fn output_parses_as_csv() {
        let results = [
            result("Name, first", 1, "He said \"no\"\nthen left", 55.5),
            result("Tag", 1, "", 0.0),
        ];
        let csv_text = to_csv(&results, CsvMode::Summary);
        let mut rdr = csv::Reader::from_reader(csv_text.as_bytes());
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(headers, vec!["Field Name", "Extracted Text", "Page Number"]);

        let rows = rdr
            .records()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Name, first");
        assert_eq!(&rows[0][1], "He said \"no\"\nthen left");
        assert_eq!(&rows[1][1], "");
    }

    #[test]
    fn export_filenames() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            default_export_filename(CsvMode::Full, date),
            "extraction-results-2024-03-09.csv"
        );
        assert_eq!(
            default_export_filename(CsvMode::Summary, date),
            "extraction-results-2024-03-09-summary.csv"
        );
        assert_eq!(
            default_export_filename(CsvMode::GroupedByPage, date),
            "extraction-results-2024-03-09-by-page.csv"
        );
    }
}
