//! Image selection for label-based image references.

use scaleway_rs::ScalewayImage;

/// Picks the newest available image matching `architecture`.
pub(crate) fn select_image_id(images: Vec<ScalewayImage>, architecture: &str) -> Option<String> {
    images
        .into_iter()
        .filter(|image| image.arch == architecture)
        .filter(|image| image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
}
