//! Reusable extraction templates.
//!
//! A [`Template`] is an ordered list of [`Region`]s plus some metadata. The
//! order matters: it's the order fields are extracted on each page, and the
//! order they appear in exported tables.
//!
//! Templates are values. Every "mutation" returns a new template and leaves
//! the receiver alone, which keeps undo/redo trivial for whoever is editing.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    errors::ExtractError,
    geometry::{Region, Shape},
    prelude::*,
};

/// A named, ordered collection of regions.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Unique identifier.
    id: Uuid,

    /// Display name. Must be non-blank before the template can be saved.
    name: String,

    /// Optional free-form description.
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    /// Regions, in creation order.
    regions: Vec<Region>,

    /// When the template was created.
    created_at: DateTime<Utc>,

    /// When the name, description or regions last changed.
    updated_at: DateTime<Utc>,
}

impl Template {
    /// Create a new, empty template.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            regions: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Can this template be saved and applied?
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty() && !self.regions.is_empty()
    }

    /// Return a copy with `region` appended.
    ///
    /// If the region has a blank field name, it's given a `Field N`
    /// placeholder based on its position.
    pub fn add_region(&self, region: Region) -> Template {
        let mut next = self.clone();
        let position = next.regions.len() + 1;
        next.regions.push(region.with_default_field_name(position));
        next.touch();
        next
    }

    /// Return a copy without the region with the given `id`. If there is no
    /// such region, the copy is identical to `self`.
    pub fn remove_region(&self, id: Uuid) -> Template {
        if !self.regions.iter().any(|r| r.id() == id) {
            return self.clone();
        }
        let mut next = self.clone();
        next.regions.retain(|r| r.id() != id);
        next.touch();
        next
    }

    /// Return a renamed copy.
    pub fn renamed(&self, name: impl Into<String>) -> Template {
        let mut next = self.clone();
        next.name = name.into();
        next.touch();
        next
    }

    /// Return a copy with a new description.
    pub fn with_description(&self, description: Option<String>) -> Template {
        let mut next = self.clone();
        next.description = description;
        next.touch();
        next
    }

    /// Bump `updated_at`, never moving it backwards.
    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }

    /// Serialize to our JSON interchange format.
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize template")
    }

    /// Parse our JSON interchange format, validating every region.
    pub fn deserialize(json: &str) -> Result<Template, ExtractError> {
        let doc = serde_json::from_str::<TemplateDocument>(json)
            .map_err(|err| ExtractError::MalformedTemplate(err.to_string()))?;
        doc.validate()
    }

    /// Load a template from a JSON file.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Template> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read template {:?}", path.display()))?;
        let template = Template::deserialize(&json)
            .with_context(|| format!("failed to load template {:?}", path.display()))?;
        debug!(
            name = %template.name,
            regions = template.regions.len(),
            "Loaded template"
        );
        Ok(template)
    }

    /// Save a complete template to a JSON file.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn save(&self, path: &Path) -> Result<()> {
        if !self.is_complete() {
            return Err(anyhow!(
                "template {:?} needs a name and at least one region before it can be saved",
                self.name
            ));
        }
        let json = self.serialize()?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write template {:?}", path.display()))
    }
}

/// The wire form of a [`Template`], before validation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateDocument {
    id: Uuid,
    name: String,
    #[serde(default)]
    description: Option<String>,
    regions: Vec<RegionDocument>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// The wire form of a [`Region`], before validation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionDocument {
    id: Uuid,
    shape: Shape,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    #[serde(default)]
    field_name: String,
}

impl TemplateDocument {
    /// Convert to a [`Template`], failing on the first invalid region.
    fn validate(self) -> Result<Template, ExtractError> {
        let mut seen = HashSet::new();
        let mut regions = Vec::with_capacity(self.regions.len());
        for (idx, r) in self.regions.into_iter().enumerate() {
            if !seen.insert(r.id) {
                return Err(ExtractError::MalformedTemplate(format!(
                    "region {} appears more than once",
                    r.id
                )));
            }
            let region =
                Region::from_parts(r.id, r.shape, r.x, r.y, r.width, r.height, r.field_name)
                    .map_err(|err| {
                        ExtractError::MalformedTemplate(format!("region {}: {err}", idx + 1))
                    })?;
            regions.push(region.with_default_field_name(idx + 1));
        }
        Ok(Template {
            id: self.id,
            name: self.name,
            description: self.description,
            regions,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::geometry::create_region;

    fn region(name: &str, x: f64) -> Region {
        create_region(Shape::Rectangle, (x, 10.0), (x + 100.0, 50.0), name).unwrap()
    }

    fn sample_template() -> Template {
        Template::new("Pump schedule")
            .with_description(Some("Sheet 1 title block".to_owned()))
            .add_region(region("Tag", 10.0))
            .add_region(
                create_region(Shape::Ellipse, (300.0, 300.0), (380.5, 344.25), "Rev")
                    .unwrap(),
            )
            .add_region(region("", 500.0))
    }

    #[test]
    fn add_region_appends_without_mutating_receiver() {
        let empty = Template::new("t");
        let one = empty.add_region(region("A", 0.0));
        let two = one.add_region(region("B", 200.0));
        assert!(empty.regions().is_empty());
        assert_eq!(one.regions().len(), 1);
        let names = two.regions().iter().map(|r| r.field_name()).collect::<Vec<_>>();
        assert_eq!(names, ["A", "B"]);
        assert!(two.updated_at() >= one.updated_at());
    }

    #[test]
    fn blank_field_names_get_positional_placeholder() {
        let template = sample_template();
        assert_eq!(template.regions()[2].field_name(), "Field 3");
    }

    #[test]
    fn remove_region_by_id() {
        let template = sample_template();
        let rev_id = template.regions()[1].id();
        let removed = template.remove_region(rev_id);
        assert_eq!(removed.regions().len(), 2);
        assert!(removed.regions().iter().all(|r| r.id() != rev_id));
    }

    #[test]
    fn remove_missing_region_is_a_noop() {
        let template = sample_template();
        assert_eq!(template.remove_region(Uuid::new_v4()), template);
    }

    #[test]
    fn completeness_requires_name_and_regions() {
        assert!(!Template::new("named").is_complete());
        assert!(!Template::new("  ").add_region(region("A", 0.0)).is_complete());
        assert!(sample_template().is_complete());
    }

    #[test]
    fn serialize_round_trip_is_lossless() {
        let template = sample_template();
        let json = template.serialize().unwrap();
        let parsed = Template::deserialize(&json).unwrap();
        assert_eq!(parsed, template);
        let order = parsed.regions().iter().map(|r| r.id()).collect::<Vec<_>>();
        let expected = template.regions().iter().map(|r| r.id()).collect::<Vec<_>>();
        assert_eq!(order, expected);
    }

    #[test]
    fn round_trip_keeps_full_precision_coordinates() {
        // Drawing on a zoomed page gives coordinates with all 17 digits in
        // use, which a fast-path float parser can get wrong by one ULP.
        let template = Template::new("Zoomed").add_region(
            create_region(
                Shape::Rectangle,
                (1264.6662904278667, 0.1 + 0.2),
                (1873.0000000000002, 97.33333333333334),
                "Tag",
            )
            .unwrap(),
        );
        let parsed = Template::deserialize(&template.serialize().unwrap()).unwrap();
        let (before, after) = (&template.regions()[0], &parsed.regions()[0]);
        assert_eq!(after.x().to_bits(), before.x().to_bits());
        assert_eq!(after.y().to_bits(), before.y().to_bits());
        assert_eq!(after.width().to_bits(), before.width().to_bits());
        assert_eq!(after.height().to_bits(), before.height().to_bits());
        assert_eq!(parsed, template);
    }

    #[test]
    fn renamed_returns_a_new_version() {
        let template = sample_template();
        let renamed = template.renamed("Pump schedule, rev B");
        assert_eq!(template.name(), "Pump schedule");
        assert_eq!(renamed.name(), "Pump schedule, rev B");
        assert_eq!(renamed.id(), template.id());
        assert_eq!(renamed.regions(), template.regions());
        assert!(renamed.updated_at() >= template.updated_at());
        assert_eq!(renamed.created_at(), template.created_at());
    }

    #[test]
    fn serialized_form_uses_interchange_field_names() {
        let value: serde_json::Value =
            serde_json::from_str(&sample_template().serialize().unwrap()).unwrap();
        for key in ["id", "name", "description", "regions", "createdAt", "updatedAt"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        let region = &value["regions"][1];
        assert_eq!(region["shape"], json!("ellipse"));
        assert_eq!(region["fieldName"], json!("Rev"));
    }

    #[test]
    fn deserialize_rejects_missing_regions() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample_template().serialize().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("regions");
        let err = Template::deserialize(&value.to_string()).unwrap_err();
        assert!(matches!(err, ExtractError::MalformedTemplate(_)));
    }

    #[test]
    fn deserialize_rejects_undersized_region() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample_template().serialize().unwrap()).unwrap();
        value["regions"][0]["width"] = json!(8.0);
        let err = Template::deserialize(&value.to_string()).unwrap_err();
        match err {
            ExtractError::MalformedTemplate(msg) => assert!(msg.contains("region 1")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deserialize_rejects_duplicate_region_ids() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample_template().serialize().unwrap()).unwrap();
        let first_id = value["regions"][0]["id"].clone();
        value["regions"][1]["id"] = first_id;
        assert!(Template::deserialize(&value.to_string()).is_err());
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(Template::deserialize("not json").is_err());
    }

    #[tokio::test]
    async fn save_and_load() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("template")?;
        let path = dir.path().join("template.json");
        let template = sample_template();
        template.save(&path).await?;
        assert_eq!(Template::load(&path).await?, template);
        Ok(())
    }

    #[tokio::test]
    async fn save_refuses_incomplete_template() {
        let dir = tempfile::TempDir::with_prefix("template").unwrap();
        let path = dir.path().join("template.json");
        assert!(Template::new("empty").save(&path).await.is_err());
        assert!(!path.exists());
    }
}
