use crate::error::ParseError;
use crate::layout::PathLayout;
use crate::parse;
use serde::Serialize;

/// One row of the long-format LoadData table: a single image file plus the
/// metadata parsed out of its path.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct ImageRecord {
    /// Filename, without any directory part.
    pub url: String,
    /// Directory part of the image path, without the filename.
    pub path: String,
    pub plate_name: String,
    pub plate_num: String,
    pub well: String,
    pub site: u32,
    pub channel: u32,
}

impl ImageRecord {
    pub fn parse(image_path: &str, layout: PathLayout) -> Result<ImageRecord, ParseError> {
        Ok(ImageRecord {
            url: parse::filename(image_path).to_string(),
            path: parse::directory(image_path),
            plate_name: parse::plate_name(image_path, layout)?,
            plate_num: parse::plate_num(image_path, layout)?,
            well: parse::well(image_path)?,
            site: parse::site(image_path)?,
            channel: parse::channel(image_path)?,
        })
    }
}

/// The images for one (well, site) field of view, ordered by channel.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ImageSet {
    pub images: Vec<String>,
}

/// A plate's image sets, either as scanned or after being split into jobs.
///
/// Downstream code pattern-matches on this instead of branching on a
/// "chunked" flag, so a flag/shape mismatch cannot exist.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ImageSetData {
    Ungrouped(Vec<ImageSet>),
    Chunked(Vec<Vec<ImageSet>>),
}

impl ImageSetData {
    pub fn is_chunked(&self) -> bool {
        matches!(self, ImageSetData::Chunked(_))
    }

    /// Total number of (well, site) groups across all jobs.
    pub fn group_count(&self) -> usize {
        match self {
            ImageSetData::Ungrouped(groups) => groups.len(),
            ImageSetData::Chunked(chunks) => chunks.iter().map(Vec::len).sum(),
        }
    }

    /// Job-sized views: a single job covering everything when ungrouped,
    /// one job per chunk otherwise.
    pub fn jobs(&self) -> Vec<&[ImageSet]> {
        match self {
            ImageSetData::Ungrouped(groups) => vec![groups.as_slice()],
            ImageSetData::Chunked(chunks) => chunks.iter().map(Vec::as_slice).collect(),
        }
    }
}
