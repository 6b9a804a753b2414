//! The plate store: every plate queued for analysis, from discovery
//! through chunking to command generation.

use crate::commands::{self, CommandSet};
use crate::filelist::{self, ScanOptions};
use crate::join::{self, JoinSummary};
use crate::loaddata::LoadDataTable;
use crate::splitter;
use anyhow::{bail, ensure, Context, Result};
use cp_types::image::ImageSetData;
use cp_types::layout::PathLayout;
use log::info;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

/// One plate queued for analysis.
#[derive(Clone, Debug)]
pub struct PlateEntry {
    pub name: String,
    /// Absolute path of the plate directory at scan time.
    pub directory: PathBuf,
    pub image_sets: ImageSetData,
}

/// Ordered registry of plates, keyed by plate name. Owned by a single
/// generate run and threaded explicitly through the pipeline stages.
#[derive(Debug, Default)]
pub struct PlateStore {
    layout: PathLayout,
    plates: BTreeMap<String, PlateEntry>,
}

/// Everything `create_commands` needs beyond the store itself.
pub struct CommandParams<'a> {
    pub pipeline: &'a Path,
    pub location: &'a Path,
    pub commands_location: &'a Path,
    /// When chunking was requested, every non-final chunk's table must
    /// carry at least this many image sets.
    pub job_size: Option<NonZeroUsize>,
}

impl PlateStore {
    pub fn new(layout: PathLayout) -> PlateStore {
        PlateStore {
            layout,
            plates: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> PathLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.plates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.is_empty()
    }

    pub fn plate_names(&self) -> Vec<String> {
        self.plates.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlateEntry> {
        self.plates.get(name)
    }

    fn insert_plate(&mut self, plate_dir: PathBuf) -> Result<()> {
        let name = plate_dir
            .file_name()
            .with_context(|| format!("plate directory '{}' has no name", plate_dir.display()))?
            .to_string_lossy()
            .into_owned();
        let files = filelist::files_from_plate(&plate_dir, &ScanOptions::with_layout(self.layout))
            .with_context(|| format!("scanning plate '{name}'"))?;
        let groups = splitter::group_by_well_site(&files)
            .with_context(|| format!("grouping images of plate '{name}'"))?;
        self.plates.insert(
            name.clone(),
            PlateEntry {
                name,
                directory: plate_dir,
                image_sets: ImageSetData::Ungrouped(groups),
            },
        );
        Ok(())
    }

    /// Add every plate found under an experiment directory.
    pub fn add_experiment(&mut self, experiment_dir: &Path) -> Result<()> {
        let plate_dirs = filelist::paths_to_plates(experiment_dir)?;
        for plate_dir in plate_dirs {
            self.insert_plate(plate_dir)?;
        }
        info!("detected {} plates", self.plates.len());
        Ok(())
    }

    /// Add selected plates from an experiment directory.
    pub fn add_plates(&mut self, experiment_dir: &Path, plates: &[String]) -> Result<()> {
        for plate in plates {
            self.insert_plate(experiment_dir.join(plate))?;
        }
        Ok(())
    }

    /// Remove plates by name; naming an absent plate is an error.
    pub fn remove_plates(&mut self, plates: &[String]) -> Result<()> {
        for plate in plates {
            self.plates
                .remove(plate)
                .with_context(|| format!("plate '{plate}' is not in the plate store"))?;
        }
        Ok(())
    }

    /// Split every plate's image sets into jobs of at most `job_size`
    /// groups. A store can only be chunked once.
    pub fn chunk(&mut self, job_size: NonZeroUsize) -> Result<()> {
        for entry in self.plates.values_mut() {
            if entry.image_sets.is_chunked() {
                bail!("plate '{}' is already chunked", entry.name);
            }
            let sets =
                std::mem::replace(&mut entry.image_sets, ImageSetData::Ungrouped(Vec::new()));
            if let ImageSetData::Ungrouped(groups) = sets {
                entry.image_sets = ImageSetData::Chunked(splitter::chunk(&groups, job_size));
            }
        }
        Ok(())
    }

    /// Build the LoadData tables, file lists and the three command
    /// sequences for every job unit, writing the per-job files as we go.
    ///
    /// Any validation failure aborts the whole run before the scheduler
    /// scripts are generated; partial command files must not be submitted.
    pub fn create_commands(&self, params: &CommandParams<'_>) -> Result<CommandSet> {
        ensure!(
            params.pipeline.is_file(),
            "pipeline file not found: {}",
            params.pipeline.display()
        );
        info!(
            "creating output directories at {}",
            params.location.display()
        );
        commands::make_output_directories(params.location)?;
        std::fs::create_dir_all(params.commands_location).with_context(|| {
            format!("creating '{}'", params.commands_location.display())
        })?;

        let mut set = CommandSet::default();
        for entry in self.plates.values() {
            info!("processing plate: {}", entry.name);
            let jobs = entry.image_sets.jobs();
            let n_jobs = jobs.len();
            for (job_num, groups) in jobs.into_iter().enumerate() {
                let name = format!("{}_{}", entry.name, job_num);
                let images: Vec<String> = groups
                    .iter()
                    .flat_map(|group| group.images.iter().cloned())
                    .collect();
                let table = LoadDataTable::from_image_list(&images, self.layout)
                    .with_context(|| format!("building LoadData for job '{name}'"))?;
                if let Some(job_size) = params.job_size {
                    // the final chunk of a plate is allowed to be short
                    if entry.image_sets.is_chunked() && job_num + 1 < n_jobs {
                        table
                            .check_min_rows(job_size.get())
                            .with_context(|| format!("validating job '{name}'"))?;
                    }
                }

                let loaddata_csv = params
                    .location
                    .join("loaddata")
                    .join(format!("{name}.csv"));
                let staged_dir = params.location.join("img_data").join(&name);
                table.write_csv(&loaddata_csv, Some(&staged_dir))?;

                let filelist_path = params.location.join("filelist").join(&name);
                commands::write_filelist(&images, &filelist_path)?;

                // the file list entries start with the plate name, so the
                // rsync source must stop at the plate's parent
                let source = entry.directory.parent().with_context(|| {
                    format!("plate directory '{}' has no parent", entry.directory.display())
                })?;
                let output_loc = params.location.join("raw_data").join(&name);
                set.push(
                    commands::rsync_command(&filelist_path, source, &staged_dir),
                    commands::cp_command(params.pipeline, &loaddata_csv, &output_loc),
                    commands::rm_command(&staged_dir),
                );
            }
        }

        commands::write_commands(params.commands_location, &set)?;
        for name in commands::COMMAND_FILE_NAMES {
            commands::check_commands(&commands::command_file_path(params.commands_location, name))?;
        }
        Ok(set)
    }

    /// Join per-job output tables back into one table per plate and
    /// pattern. Best-effort: combinations with no matching files are
    /// skipped, not errors.
    pub fn join_results(&self, location: &Path, patterns: &[String]) -> Result<JoinSummary> {
        let names = self.plate_names();
        join::join_plate_files(&names, &location.join("raw_data"), patterns)
    }
}
