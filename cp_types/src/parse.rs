//! Extract plate, well, site and channel metadata from image paths.
//!
//! Filenames follow the ImageXpress convention
//! `{prefix}_{well}_s{site}_w{channel}{id}.{ext}`, e.g.
//! `val screen_B02_s1_w1C1DA9D2C.tif`. The plate name and plate number are
//! positional within the directory part of the path and depend on the
//! instrument layout.

use crate::error::ParseError;
use crate::layout::PathLayout;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WELL_SITE_CHANNEL: Regex = Regex::new(r"_([A-P][0-9]{2})_s([0-9]+)_w([0-9])").unwrap();
}

/// Final segment of a `/`-separated path.
pub fn filename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Directory part of a `/`-separated path, without the filename.
pub fn directory(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

fn well_site_channel(path: &str) -> Result<(String, u32, u32), ParseError> {
    let name = filename(path);
    let caps = WELL_SITE_CHANNEL
        .captures(name)
        .ok_or_else(|| ParseError::Unparseable {
            filename: name.to_string(),
        })?;
    let parse_num = |idx: usize| {
        caps[idx].parse::<u32>().map_err(|_| ParseError::Unparseable {
            filename: name.to_string(),
        })
    };
    Ok((caps[1].to_string(), parse_num(2)?, parse_num(3)?))
}

/// Well identifier, e.g. `B02`.
pub fn well(path: &str) -> Result<String, ParseError> {
    well_site_channel(path).map(|(w, _, _)| w)
}

/// Site number within the well.
pub fn site(path: &str) -> Result<u32, ParseError> {
    well_site_channel(path).map(|(_, s, _)| s)
}

/// Imaging channel number.
pub fn channel(path: &str) -> Result<u32, ParseError> {
    well_site_channel(path).map(|(_, _, c)| c)
}

fn segment_from_end<'a>(
    path: &'a str,
    back: usize,
    segment: &'static str,
    layout: PathLayout,
) -> Result<&'a str, ParseError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < back {
        return Err(ParseError::TooShallow {
            path: path.to_string(),
            segment,
            layout,
        });
    }
    Ok(segments[segments.len() - back])
}

/// Plate name segment of an image path.
pub fn plate_name(path: &str, layout: PathLayout) -> Result<String, ParseError> {
    segment_from_end(path, layout.plate_name_offset(), "plate name", layout).map(str::to_string)
}

/// Plate number segment of an image path. Kept as a string since instrument
/// software writes arbitrary directory names here.
pub fn plate_num(path: &str, layout: PathLayout) -> Result<String, ParseError> {
    segment_from_end(path, layout.plate_num_offset(), "plate number", layout).map(str::to_string)
}

/// Thumbnail images are exported alongside the real data and must never end
/// up in a LoadData table.
pub fn is_thumbnail(path: &str) -> bool {
    filename(path).to_ascii_lowercase().contains("thumb")
}

/// Drop thumbnails, files with the wrong extension and files whose names
/// carry no well/site/channel metadata.
pub fn clean(files: Vec<String>, extension: &str) -> Vec<String> {
    files
        .into_iter()
        .filter(|f| {
            let name = filename(f);
            name.ends_with(extension) && !is_thumbnail(name) && WELL_SITE_CHANNEL.is_match(name)
        })
        .collect()
}
