//! Render the per-job shell commands and write the command files.

use anyhow::{Context, Result};
use cp_types::error::CommandError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Stems of the three command files, in phase order.
pub const COMMAND_FILE_NAMES: [&str; 3] = ["staging", "cp_commands", "destaging"];

pub fn command_file_path(commands_location: &Path, name: &str) -> PathBuf {
    commands_location.join(format!("{name}.txt"))
}

/// The three command sequences, index-aligned: entry `i` of each sequence
/// belongs to the same job unit. The script generator depends on this
/// alignment to map array-task indices to command lines.
#[derive(Clone, Debug, Default)]
pub struct CommandSet {
    pub stage: Vec<String>,
    pub analyze: Vec<String>,
    pub destage: Vec<String>,
}

impl CommandSet {
    /// Append the aligned command triple for one job unit.
    pub fn push(&mut self, stage: String, analyze: String, destage: String) {
        self.stage.push(stage);
        self.analyze.push(analyze);
        self.destage.push(destage);
    }

    pub fn len(&self) -> usize {
        self.analyze.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyze.is_empty()
    }
}

/// Non-interactive CellProfiler invocation for one job unit.
pub fn cp_command(pipeline: &Path, load_data: &Path, output_location: &Path) -> String {
    format!(
        "cellprofiler -r -c -p {} --data-file={} -o {}",
        pipeline.display(),
        load_data.display(),
        output_location.display()
    )
}

/// rsync invocation copying exactly the files named in a job's file list
/// onto local scratch.
///
/// `source` must be the plate directory's parent: the file list entries are
/// plate-name-relative, so including the plate name in the source would
/// duplicate that segment in every staged path.
pub fn rsync_command(filelist: &Path, source: &Path, destination: &Path) -> String {
    format!(
        "rsync -sp --files-from=\"{}\" \"{}\" \"{}\"",
        filelist.display(),
        source.display(),
        destination.display()
    )
}

/// Removal of a job's staged data after analysis. Irreversible.
pub fn rm_command(directory: &Path) -> String {
    format!("rm -rf \"{}\"", directory.display())
}

/// Create the output directory tree under `location`.
pub fn make_output_directories(location: &Path) -> Result<()> {
    for dir in ["loaddata", "img_data", "filelist", "raw_data", "logfiles"] {
        std::fs::create_dir_all(location.join(dir))
            .with_context(|| format!("creating '{}'", location.join(dir).display()))?;
    }
    for sub in ["staging", "analysis", "destaging"] {
        let dir = location.join("logfiles").join(sub);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating '{}'", dir.display()))?;
    }
    Ok(())
}

/// Write a job's file list, one image path per line.
pub fn write_filelist(images: &[String], filelist_path: &Path) -> Result<()> {
    let file = File::create(filelist_path)
        .with_context(|| format!("creating file list '{}'", filelist_path.display()))?;
    let mut out = BufWriter::new(file);
    for image in images {
        writeln!(out, "{image}")?;
    }
    out.flush()?;
    Ok(())
}

fn write_single(commands_location: &Path, commands: &[String], name: &str) -> Result<()> {
    let path = command_file_path(commands_location, name);
    let file =
        File::create(&path).with_context(|| format!("creating '{}'", path.display()))?;
    let mut out = BufWriter::new(file);
    for line in commands {
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

/// Write the three command files, one command per line, order preserved.
pub fn write_commands(commands_location: &Path, set: &CommandSet) -> Result<()> {
    let sequences = [&set.stage, &set.analyze, &set.destage];
    for (commands, name) in sequences.iter().zip(COMMAND_FILE_NAMES) {
        write_single(commands_location, commands, name)?;
    }
    Ok(())
}

/// Number of lines in a command file.
pub fn count_lines(path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading '{}'", path.display()))?;
    Ok(text.lines().count())
}

/// An empty command file means an upstream stage produced zero image sets,
/// which is a configuration or scan problem, never a legitimate state.
pub fn check_commands(path: &Path) -> Result<()> {
    if count_lines(path)? == 0 {
        return Err(CommandError::EmptyCommands {
            path: path.to_path_buf(),
        }
        .into());
    }
    Ok(())
}
