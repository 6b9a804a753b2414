//! Concatenate per-job output tables back into one table per plate.
//!
//! Chunking spreads a plate's results over many `{plate}_{job}` output
//! directories; after the cluster run finishes this module stitches the
//! requested file patterns back together. Joining is best-effort per
//! (plate, pattern): a combination with no matching files is skipped with
//! a warning, since a pattern may legitimately exist for only some plates.

use anyhow::{Context, Result};
use cp_types::error::ScanError;
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// What one (plate, pattern) join produced.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct JoinedFile {
    pub output_file: PathBuf,
    /// Data rows in the combined table, headers excluded.
    pub rows: usize,
    pub files_combined: usize,
}

/// plate name -> pattern -> result.
pub type JoinSummary = BTreeMap<String, BTreeMap<String, JoinedFile>>;

/// Combine every `{plate}_*/{pattern}` table under `raw_data_location`
/// into `joined_files/{plate}_{pattern}`, per plate, per pattern.
pub fn join_plate_files(
    plate_names: &[String],
    raw_data_location: &Path,
    patterns: &[String],
) -> Result<JoinSummary> {
    let mut summary = JoinSummary::new();
    if patterns.is_empty() {
        info!("no file joining patterns specified, skipping file joining");
        return Ok(summary);
    }
    for pattern in patterns {
        info!("processing pattern: {pattern}");
        for plate in plate_names {
            let glob_pattern = format!(
                "{}/{}_*/{}",
                raw_data_location.display(),
                plate,
                pattern
            );
            let mut matched: Vec<PathBuf> = glob::glob(&glob_pattern)
                .with_context(|| format!("bad glob pattern '{glob_pattern}'"))?
                .filter_map(Result::ok)
                .collect();
            matched.sort();
            if matched.is_empty() {
                warn!("no files found for plate {plate} with pattern {pattern}");
                continue;
            }

            let output_dir = raw_data_location.join("joined_files");
            std::fs::create_dir_all(&output_dir)
                .with_context(|| format!("creating '{}'", output_dir.display()))?;
            let output_file = output_dir.join(format!("{plate}_{pattern}"));
            let (rows, files_combined) = concat_csv_files(&matched, &output_file)?;

            info!(
                "created {} with {} rows from {} files",
                output_file.display(),
                rows,
                files_combined
            );
            summary.entry(plate.clone()).or_default().insert(
                pattern.clone(),
                JoinedFile {
                    output_file,
                    rows,
                    files_combined,
                },
            );
        }
    }
    Ok(summary)
}

/// Row-wise CSV concatenation. The header comes from the first file; a
/// file whose header disagrees is skipped with a warning rather than
/// corrupting the combined table.
fn concat_csv_files(files: &[PathBuf], output_file: &Path) -> Result<(usize, usize)> {
    let mut writer = csv::Writer::from_path(output_file)
        .with_context(|| format!("creating '{}'", output_file.display()))?;
    let mut expected_header: Option<csv::StringRecord> = None;
    let mut rows = 0;
    let mut files_combined = 0;
    for file in files {
        let mut reader = csv::Reader::from_path(file)
            .with_context(|| format!("reading '{}'", file.display()))?;
        let header = reader
            .headers()
            .with_context(|| format!("reading header of '{}'", file.display()))?
            .clone();
        match &expected_header {
            None => {
                writer.write_record(&header)?;
                expected_header = Some(header);
            }
            Some(expected) if *expected != header => {
                warn!(
                    "skipping '{}': header does not match '{}'",
                    file.display(),
                    files[0].display()
                );
                continue;
            }
            Some(_) => {}
        }
        for record in reader.records() {
            let record =
                record.with_context(|| format!("reading '{}'", file.display()))?;
            writer.write_record(&record)?;
            rows += 1;
        }
        files_combined += 1;
    }
    writer
        .flush()
        .with_context(|| format!("writing '{}'", output_file.display()))?;
    Ok((rows, files_combined))
}

/// Plate names inferred from the `{plate}_{job}` output directories, for
/// joining without a populated plate store.
pub fn discover_plate_names(raw_data_location: &Path) -> Result<Vec<String>> {
    if !raw_data_location.is_dir() {
        return Err(ScanError::NotFound {
            path: raw_data_location.to_path_buf(),
        }
        .into());
    }
    let mut names = BTreeSet::new();
    for entry in std::fs::read_dir(raw_data_location)
        .with_context(|| format!("reading '{}'", raw_data_location.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(dir_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some((plate, job)) = dir_name.rsplit_once('_') {
            if !plate.is_empty() && job.chars().all(|c| c.is_ascii_digit()) && !job.is_empty() {
                names.insert(plate.to_string());
            }
        }
    }
    Ok(names.into_iter().collect())
}
