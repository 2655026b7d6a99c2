//! Instance lifecycle helpers for the Scaleway backend.

mod create;
mod image;
mod wait;

pub(crate) use image::select_image_id;
