//! Build the CSV tables consumed by CellProfiler's LoadData module.
//!
//! The long table has one row per image file; the wide table has one row
//! per image set with a FileName/PathName column pair per channel.

use anyhow::{Context, Result};
use cp_types::error::{ParseError, TableError};
use cp_types::image::ImageRecord;
use cp_types::layout::PathLayout;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Parse every image path into a long-table row. No row is ever dropped;
/// a path that fails to parse aborts the whole table.
pub fn long_table(image_paths: &[String], layout: PathLayout) -> Result<Vec<ImageRecord>, ParseError> {
    image_paths
        .iter()
        .map(|p| ImageRecord::parse(p, layout))
        .collect()
}

/// One wide-table row: an image set with a filename per channel.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoadDataRow {
    pub site: u32,
    pub well: String,
    pub plate_num: String,
    pub plate_name: String,
    /// Source directory of the images, shared by every channel of the set.
    pub path: String,
    /// One filename per channel, in ascending channel order.
    pub filenames: Vec<String>,
}

/// Wide-format LoadData table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoadDataTable {
    channels: Vec<u32>,
    rows: Vec<LoadDataRow>,
}

impl LoadDataTable {
    /// Pivot long-table records into wide format.
    ///
    /// Rows are grouped by (site, well, plate number, plate name, path);
    /// the channel set is taken from the whole long table. Every group
    /// must contribute exactly one filename per channel: a missing cell is
    /// a structural error, a duplicate keeps the first occurrence.
    pub fn pivot(records: &[ImageRecord]) -> Result<LoadDataTable, TableError> {
        let channels: Vec<u32> = records
            .iter()
            .map(|r| r.channel)
            .collect::<BTreeSet<u32>>()
            .into_iter()
            .collect();
        type SetKey = (u32, String, String, String, String);
        let mut groups: BTreeMap<SetKey, BTreeMap<u32, String>> = BTreeMap::new();
        for r in records {
            let key = (
                r.site,
                r.well.clone(),
                r.plate_num.clone(),
                r.plate_name.clone(),
                r.path.clone(),
            );
            groups
                .entry(key)
                .or_default()
                .entry(r.channel)
                .or_insert_with(|| r.url.clone());
        }
        let mut rows = Vec::with_capacity(groups.len());
        for ((site, well, plate_num, plate_name, path), by_channel) in groups {
            let filenames = channels
                .iter()
                .map(|channel| {
                    by_channel
                        .get(channel)
                        .cloned()
                        .ok_or_else(|| TableError::IncompleteRow {
                            plate_name: plate_name.clone(),
                            well: well.clone(),
                            site,
                            channel: *channel,
                            n_channels: channels.len(),
                        })
                })
                .collect::<Result<Vec<String>, TableError>>()?;
            rows.push(LoadDataRow {
                site,
                well,
                plate_num,
                plate_name,
                path,
                filenames,
            });
        }
        Ok(LoadDataTable { channels, rows })
    }

    /// Build the wide table straight from image paths.
    pub fn from_image_list(image_paths: &[String], layout: PathLayout) -> Result<LoadDataTable> {
        let records = long_table(image_paths, layout)?;
        Ok(LoadDataTable::pivot(&records)?)
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// 4 metadata columns plus a FileName/PathName pair per channel.
    pub fn n_columns(&self) -> usize {
        4 + 2 * self.channels.len()
    }

    pub fn rows(&self) -> &[LoadDataRow] {
        &self.rows
    }

    /// Guard against silent mis-grouping: every chunk's table except the
    /// last chunk of a plate must carry at least `min_rows` image sets.
    pub fn check_min_rows(&self, min_rows: usize) -> Result<(), TableError> {
        if self.rows.len() < min_rows {
            return Err(TableError::TooFewRows {
                expected: min_rows,
                actual: self.rows.len(),
            });
        }
        Ok(())
    }

    /// Write the table as a LoadData CSV.
    ///
    /// With `staged_prefix` set, PathName columns point below the staging
    /// directory the images will occupy after the stage phase, rather than
    /// at their source location.
    pub fn write_csv(&self, out: &Path, staged_prefix: Option<&Path>) -> Result<()> {
        let mut wtr = csv::Writer::from_path(out)
            .with_context(|| format!("creating LoadData csv '{}'", out.display()))?;
        let mut header = vec![
            "Metadata_site".to_string(),
            "Metadata_well".to_string(),
            "Metadata_platenum".to_string(),
            "Metadata_platename".to_string(),
        ];
        for i in 1..=self.channels.len() {
            header.push(format!("FileName_W{i}"));
        }
        for i in 1..=self.channels.len() {
            header.push(format!("PathName_W{i}"));
        }
        wtr.write_record(&header)?;
        for row in &self.rows {
            let pathname = match staged_prefix {
                Some(prefix) => prefix.join(&row.path).to_string_lossy().into_owned(),
                None => row.path.clone(),
            };
            let mut record = vec![
                row.site.to_string(),
                row.well.clone(),
                row.plate_num.clone(),
                row.plate_name.clone(),
            ];
            record.extend(row.filenames.iter().cloned());
            record.extend(std::iter::repeat(pathname).take(self.channels.len()));
            wtr.write_record(&record)?;
        }
        wtr.flush()
            .with_context(|| format!("writing LoadData csv '{}'", out.display()))?;
        Ok(())
    }
}
