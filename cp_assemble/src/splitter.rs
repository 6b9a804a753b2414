//! Group image files into per-field image sets and split them into jobs.

use cp_types::error::ParseError;
use cp_types::image::ImageSet;
use cp_types::parse;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;

/// Group image paths by (well, site) and order each group by channel.
///
/// Groups are emitted sorted by well, then numeric site, so chunk
/// assignment and job naming are stable across runs.
pub fn group_by_well_site(image_paths: &[String]) -> Result<Vec<ImageSet>, ParseError> {
    let mut groups: BTreeMap<(String, u32), Vec<(u32, String)>> = BTreeMap::new();
    for path in image_paths {
        let well = parse::well(path)?;
        let site = parse::site(path)?;
        let channel = parse::channel(path)?;
        groups
            .entry((well, site))
            .or_default()
            .push((channel, path.clone()));
    }
    Ok(groups
        .into_values()
        .map(|mut images| {
            images.sort_by_key(|(channel, _)| *channel);
            ImageSet {
                images: images.into_iter().map(|(_, path)| path).collect(),
            }
        })
        .collect())
}

/// Split an ordered group list into consecutive chunks of at most
/// `job_size` groups; the final chunk may be smaller.
pub fn chunk(groups: &[ImageSet], job_size: NonZeroUsize) -> Vec<Vec<ImageSet>> {
    groups
        .chunks(job_size.get())
        .map(<[ImageSet]>::to_vec)
        .collect()
}

/// Group then chunk in one step.
pub fn split(
    image_paths: &[String],
    job_size: NonZeroUsize,
) -> Result<Vec<Vec<ImageSet>>, ParseError> {
    let groups = group_by_well_site(image_paths)?;
    Ok(chunk(&groups, job_size))
}
