//! Container image reference helpers.
//!
//! Runners run the same release as the controller, so runner images always
//! carry the controller's tag.

use thiserror::Error;

/// Runner image used when a module does not name one.
pub const DEFAULT_RUNNER_BASE: &str = "ftl0/ftl-runner";

const STOCK_NAMESPACE: &str = "ftl0/";
const CONTROLLER_NAME: &str = "ftl-controller";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("no tag found in image {0}")]
    MissingTag(String),

    #[error("module runtime's image should not contain a tag: {0}")]
    TaggedBase(String),
}

/// Split `image` into repository and tag, ignoring any `@digest`.
fn split(image: &str) -> Result<(&str, &str), ImageError> {
    let undigested = image.split_once('@').map_or(image, |(name, _)| name);
    match undigested.rsplit_once(':') {
        // A colon followed by a path is a registry port, not a tag.
        Some((base, tag)) if !tag.contains('/') && !tag.is_empty() => Ok((base, tag)),
        _ => Err(ImageError::MissingTag(image.to_string())),
    }
}

/// Tag of `image`, without any digest.
pub fn extract_tag(image: &str) -> Result<&str, ImageError> {
    split(image).map(|(_, tag)| tag)
}

/// Everything before the tag separator.
pub fn extract_base(image: &str) -> Result<&str, ImageError> {
    split(image).map(|(base, _)| base)
}

/// Runner image for a module, given the controller's own image.
///
/// Stock images (`ftl0/...`) live next to the controller image, so the
/// controller's registry path is reused with the runner name substituted.
/// Any other base is used as is. Both get the controller's tag.
pub fn runner_image(controller_image: &str, runner_base: Option<&str>) -> Result<String, ImageError> {
    let (controller_base, tag) = split(controller_image)?;
    let base = runner_base.filter(|b| !b.is_empty()).unwrap_or(DEFAULT_RUNNER_BASE);
    if base.contains(':') {
        return Err(ImageError::TaggedBase(base.to_string()));
    }
    let repository = match base.strip_prefix(STOCK_NAMESPACE) {
        Some(name) => controller_base.replace(CONTROLLER_NAME, name),
        None => base.to_string(),
    };
    Ok(format!("{repository}:{tag}"))
}
