//! The `template` subcommand.

use std::{fmt::Write as _, str::FromStr};

use clap::{Args, Subcommand};

use crate::{
    async_utils::io::write_text_output,
    geometry::{Shape, begin_draw},
    prelude::*,
    template::Template,
};

/// Template command line arguments.
#[derive(Debug, Args)]
pub struct TemplateOpts {
    #[clap(subcommand)]
    pub cmd: TemplateCmd,
}

/// Things we can do with templates.
#[derive(Debug, Subcommand)]
pub enum TemplateCmd {
    /// Create a template from a list of regions.
    New(NewTemplateOpts),
    /// Check a template and print a summary.
    Show(ShowTemplateOpts),
    /// Give a template a new name, keeping its id and regions.
    Rename(RenameTemplateOpts),
}

impl TemplateOpts {
    /// Are we using stdout for output?
    pub fn using_stdout_for_output(&self) -> bool {
        matches!(self.cmd, TemplateCmd::Show(_))
    }
}

/// Arguments for `template new`.
#[derive(Debug, Args)]
pub struct NewTemplateOpts {
    /// The template name.
    pub name: String,

    /// A longer description of the template.
    #[clap(long)]
    pub description: Option<String>,

    /// A region to extract, as `SHAPE:X0,Y0,X1,Y1[:FIELD]`, where SHAPE is
    /// `rect` or `ellipse` and the two points are opposite corners in page
    /// pixels. May be repeated. Unnamed fields are called "Field N".
    #[clap(long = "region", value_name = "REGION", required = true)]
    pub regions: Vec<RegionArg>,

    /// Where to save the template.
    #[clap(short = 'o', long = "out")]
    pub output_path: PathBuf,
}

/// Arguments for `template show`.
#[derive(Debug, Args)]
pub struct ShowTemplateOpts {
    /// The template to show.
    pub path: PathBuf,
}

/// Arguments for `template rename`.
#[derive(Debug, Args)]
pub struct RenameTemplateOpts {
    /// The template to rename.
    pub path: PathBuf,

    /// The new name.
    pub name: String,

    /// Save the renamed template here instead of overwriting it.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// A region as given on the command line.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionArg {
    shape: Shape,
    start: (f64, f64),
    end: (f64, f64),
    field_name: String,
}

impl FromStr for RegionArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let shape = match parts.next().unwrap_or_default() {
            "rect" | "rectangle" => Shape::Rectangle,
            "ellipse" => Shape::Ellipse,
            other => {
                return Err(anyhow!(
                    "unknown shape {other:?} (expected \"rect\" or \"ellipse\")"
                ));
            }
        };
        let coords = parts
            .next()
            .ok_or_else(|| anyhow!("missing coordinates in region {s:?}"))?
            .split(',')
            .map(|c| {
                c.trim()
                    .parse::<f64>()
                    .with_context(|| format!("bad coordinate {c:?} in region {s:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let [x0, y0, x1, y1] = coords[..] else {
            return Err(anyhow!("expected 4 coordinates in region {s:?}"));
        };
        Ok(RegionArg {
            shape,
            start: (x0, y0),
            end: (x1, y1),
            field_name: parts.next().unwrap_or_default().to_owned(),
        })
    }
}

/// The `template` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_template(opts: &TemplateOpts) -> Result<()> {
    match &opts.cmd {
        TemplateCmd::New(opts) => cmd_template_new(opts).await,
        TemplateCmd::Show(opts) => cmd_template_show(opts).await,
        TemplateCmd::Rename(opts) => cmd_template_rename(opts).await,
    }
}

async fn cmd_template_new(opts: &NewTemplateOpts) -> Result<()> {
    let mut template =
        Template::new(opts.name.clone()).with_description(opts.description.clone());
    for (idx, arg) in opts.regions.iter().enumerate() {
        let mut session = begin_draw(arg.shape, arg.start.0, arg.start.1);
        session.update_draw(arg.end.0, arg.end.1);
        let region = session
            .commit_draw(arg.field_name.clone())
            .with_context(|| format!("region {} was rejected", idx + 1))?;
        template = template.add_region(region);
    }
    template.save(&opts.output_path).await?;
    info!(
        "Saved template {:?} with {} regions to {}",
        template.name(),
        template.regions().len(),
        opts.output_path.display()
    );
    Ok(())
}

async fn cmd_template_show(opts: &ShowTemplateOpts) -> Result<()> {
    let template = Template::load(&opts.path).await?;
    write_text_output(None, &describe(&template)).await
}

async fn cmd_template_rename(opts: &RenameTemplateOpts) -> Result<()> {
    let template = Template::load(&opts.path).await?.renamed(opts.name.trim());
    let output_path = opts.output_path.as_deref().unwrap_or(&opts.path);
    template.save(output_path).await?;
    info!(
        "Renamed template to {:?} in {}",
        template.name(),
        output_path.display()
    );
    Ok(())
}

/// A human-readable summary of a template.
fn describe(template: &Template) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Template: {}", template.name());
    if let Some(description) = template.description() {
        let _ = writeln!(out, "Description: {description}");
    }
    let _ = writeln!(out, "Id: {}", template.id());
    let _ = writeln!(out, "Created: {}", template.created_at().to_rfc3339());
    let _ = writeln!(out, "Updated: {}", template.updated_at().to_rfc3339());
    let _ = writeln!(out, "Regions: {}", template.regions().len());
    for (idx, region) in template.regions().iter().enumerate() {
        let _ = write!(
            out,
            "  {}. {} ({}) at {:.0},{:.0} size {:.0}x{:.0}",
            idx + 1,
            region.field_name(),
            region.shape(),
            region.x(),
            region.y(),
            region.width(),
            region.height(),
        );
        if region.shape() == Shape::Ellipse {
            let (cx, cy) = region.center();
            let (rx, ry) = region.radii();
            let _ = write!(out, ", center {cx:.0},{cy:.0} radii {rx:.0}x{ry:.0}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::create_region;

    #[test]
    fn parses_region_args() {
        let arg = "rect:100,100,250,140:Tag".parse::<RegionArg>().unwrap();
        assert_eq!(arg.shape, Shape::Rectangle);
        assert_eq!(arg.start, (100.0, 100.0));
        assert_eq!(arg.end, (250.0, 140.0));
        assert_eq!(arg.field_name, "Tag");

        let arg = "ellipse: 5, 6, 70, 80".parse::<RegionArg>().unwrap();
        assert_eq!(arg.shape, Shape::Ellipse);
        assert_eq!(arg.field_name, "");

        // Field names may contain colons.
        let arg = "rect:0,0,20,20:Time: start".parse::<RegionArg>().unwrap();
        assert_eq!(arg.field_name, "Time: start");
    }

    #[test]
    fn rejects_bad_region_args() {
        assert!("square:0,0,20,20".parse::<RegionArg>().is_err());
        assert!("rect".parse::<RegionArg>().is_err());
        assert!("rect:0,0,20".parse::<RegionArg>().is_err());
        assert!("rect:0,0,20,x".parse::<RegionArg>().is_err());
    }

    #[test]
    fn describes_regions() {
        let template = Template::new("Plant")
            .add_region(
                create_region(Shape::Rectangle, (100.0, 100.0), (250.0, 140.0), "Tag")
                    .unwrap(),
            )
            .add_region(
                create_region(Shape::Ellipse, (0.0, 0.0), (40.0, 20.0), "").unwrap(),
            );
        let text = describe(&template);
        assert!(text.starts_with("Template: Plant\n"));
        assert!(text.contains("Regions: 2\n"));
        assert!(text.contains("  1. Tag (rectangle) at 100,100 size 150x40\n"));
        assert!(text.contains(
            "  2. Field 2 (ellipse) at 0,0 size 40x20, center 20,10 radii 20x10\n"
        ));
    }
}
