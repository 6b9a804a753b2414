use crate::layout::PathLayout;
use std::path::PathBuf;

/// Failure to extract metadata from an image path.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no well/site/channel pattern in image filename '{filename}'")]
    Unparseable { filename: String },

    #[error(
        "path '{path}' has too few segments to locate the {segment} for the {layout:?} layout"
    )]
    TooShallow {
        path: String,
        segment: &'static str,
        layout: PathLayout,
    },
}

/// Failure while discovering plates or image files on disk.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("'{}' is not a directory", .path.display())]
    NotFound { path: PathBuf },

    #[error("no image files found in '{}'", .path.display())]
    NoImages { path: PathBuf },
}

/// Structural problem in a LoadData table.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error(
        "image set {well} site {site} of plate '{plate_name}' is missing channel {channel} \
         ({n_channels} channels present elsewhere in the table)"
    )]
    IncompleteRow {
        plate_name: String,
        well: String,
        site: u32,
        channel: u32,
        n_channels: usize,
    },

    #[error("too few rows in a LoadData table: expected at least {expected}, actual {actual}")]
    TooFewRows { expected: usize, actual: usize },
}

/// Inconsistency in the generated command files.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("commands file '{}' is empty, something has gone wrong upstream", .path.display())]
    EmptyCommands { path: PathBuf },

    #[error(
        "command files contain differing numbers of lines: \
         staging {staging}, analysis {analysis}, destaging {destaging}"
    )]
    MisalignedCommands {
        staging: usize,
        analysis: usize,
        destaging: usize,
    },
}
