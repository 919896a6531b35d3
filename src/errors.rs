//! Errors which are allowed to escape a batch.
//!
//! Almost everything in this program reports errors using [`anyhow`]. The
//! exceptions are the few failures that callers are expected to match on: an
//! extraction run that can't start, and a template that can't be loaded.
//! Failures _inside_ a run are never raised. They're recorded on each
//! [`crate::extraction::ExtractionResult`] instead.

use std::{error, fmt};

/// A failure at the boundary of an extraction batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// The template has no regions, so there is nothing to extract.
    EmptyTemplate,

    /// We were given no pages to extract from.
    NoPages,

    /// A serialized template was missing required fields or contained an
    /// invalid region.
    MalformedTemplate(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::EmptyTemplate => {
                write!(f, "template has no regions to extract")
            }
            ExtractError::NoPages => write!(f, "no pages to extract from"),
            ExtractError::MalformedTemplate(msg) => {
                write!(f, "malformed template: {msg}")
            }
        }
    }
}

impl error::Error for ExtractError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_anyhow_and_back() {
        let err = anyhow::Error::from(ExtractError::NoPages);
        assert_eq!(
            err.downcast_ref::<ExtractError>(),
            Some(&ExtractError::NoPages)
        );
        assert_eq!(err.to_string(), "no pages to extract from");
    }

    #[test]
    fn malformed_template_includes_reason() {
        let err = ExtractError::MalformedTemplate("missing field `regions`".to_owned());
        assert!(err.to_string().contains("missing field `regions`"));
    }
}
