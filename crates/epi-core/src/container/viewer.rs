//! Self-contained HTML viewer embedded in containers.
//!
//! The template carries one `{{EPI_DATA}}` placeholder inside
//! `<script id="epi-data" type="application/json">`. It is replaced by
//! `{"manifest": ..., "steps": [...]}` with every `</` escaped so the payload
//! cannot close the script element.

use serde::Serialize;
use thiserror::Error;

use crate::manifest::{Manifest, StepRecord};

/// Placeholder substituted with the embedded data.
pub const DATA_PLACEHOLDER: &str = "{{EPI_DATA}}";

/// Template shipped with the crate.
pub const DEFAULT_VIEWER_TEMPLATE: &str = include_str!("../../assets/viewer.html");

/// Errors rendering a viewer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ViewerError {
    /// The template must contain the placeholder exactly once.
    #[error("viewer template must contain the data placeholder exactly once, found {found}")]
    Placeholder {
        /// Number of occurrences found.
        found: usize,
    },

    /// The placeholder is not inside the `epi-data` script element.
    #[error("viewer data placeholder must sit inside the epi-data script element")]
    DataScript,

    /// The embedded data could not be serialized.
    #[error("cannot serialize viewer data: {message}")]
    Serialize {
        /// Serializer message.
        message: String,
    },
}

#[derive(Serialize)]
struct ViewerData<'a> {
    manifest: &'a Manifest,
    steps: &'a [StepRecord],
}

/// Renders `template` with the manifest and steps embedded.
///
/// # Errors
///
/// Returns [`ViewerError::Placeholder`] if the template does not contain the
/// placeholder exactly once.
pub fn render_viewer(
    template: &str,
    manifest: &Manifest,
    steps: &[StepRecord],
) -> Result<String, ViewerError> {
    let found = template.matches(DATA_PLACEHOLDER).count();
    if found != 1 {
        return Err(ViewerError::Placeholder { found });
    }
    match data_span(template) {
        Some((start, end)) if template[start..end].contains(DATA_PLACEHOLDER) => {},
        _ => return Err(ViewerError::DataScript),
    }
    let json = serde_json::to_string(&ViewerData { manifest, steps }).map_err(|e| {
        ViewerError::Serialize {
            message: e.to_string(),
        }
    })?;
    Ok(template.replacen(DATA_PLACEHOLDER, &json.replace("</", "<\\/"), 1))
}

#[derive(Serialize)]
struct EmbeddedSteps<'a> {
    steps: [&'a StepRecord; 1],
}

/// Checks that `step` reads back once embedded in a viewer payload, the
/// deepest place a step is stored.
pub(crate) fn check_step_embeddable(step: &StepRecord) -> Result<(), serde_json::Error> {
    let json = serde_json::to_string(&EmbeddedSteps { steps: [step] })?;
    serde_json::from_str::<serde_json::Value>(&json).map(drop)
}

/// The payload [`render_viewer`] embeds, as a JSON value.
pub(crate) fn viewer_payload(
    manifest: &Manifest,
    steps: &[StepRecord],
) -> Result<serde_json::Value, ViewerError> {
    serde_json::to_value(ViewerData { manifest, steps }).map_err(|e| ViewerError::Serialize {
        message: e.to_string(),
    })
}

/// A template or rendered viewer with its data script emptied down to the
/// placeholder.
///
/// Every rendering of one template has the same form, so its digest can be
/// recorded before the manifest it will embed is signed.
pub(crate) fn viewer_template_form(html: &str) -> Result<String, ViewerError> {
    let (start, end) = data_span(html).ok_or(ViewerError::DataScript)?;
    Ok(format!("{}{DATA_PLACEHOLDER}{}", &html[..start], &html[end..]))
}

/// Replaces the data embedded in an already rendered viewer.
///
/// Used when a container is re-signed and the template it was rendered from
/// is no longer available.
///
/// # Errors
///
/// Returns [`ViewerError::Placeholder`] if the viewer has no data script.
pub fn reembed_viewer(
    html: &str,
    manifest: &Manifest,
    steps: &[StepRecord],
) -> Result<String, ViewerError> {
    let template = viewer_template_form(html)?;
    render_viewer(&template, manifest, steps)
}

/// Byte range of the embedded payload.
fn data_span(html: &str) -> Option<(usize, usize)> {
    const OPEN: &str = r#"<script id="epi-data" type="application/json">"#;
    let start = html.find(OPEN)? + OPEN.len();
    let len = html[start..].find("</script>")?;
    Some((start, start + len))
}

/// Extracts the embedded JSON payload from a rendered viewer.
#[must_use]
pub fn extract_viewer_data(html: &str) -> Option<serde_json::Value> {
    let (start, end) = data_span(html)?;
    serde_json::from_str(&html[start..end]).ok()
}
