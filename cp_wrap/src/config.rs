//! YAML run configuration.
//!
//! The config file doubles as the record of how a run was produced, so it
//! is validated strictly: every unrecognized key is collected and reported
//! in a single error instead of one at a time, and the pipeline file must
//! exist before any work starts.

use anyhow::{Context, Result};
use cp_types::layout::PathLayout;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

const VALID_KEYS: [&str; 10] = [
    "experiment",
    "pipeline",
    "location",
    "commands location",
    "chunk",
    "add plate",
    "remove plate",
    "new ix",
    "join files",
    "transfer to",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized configuration argument(s): {}", .keys.join(", "))]
    UnrecognizedKeys { keys: Vec<String> },

    #[error("configuration file '{}' is not a key-value mapping", .path.display())]
    NotAMapping { path: PathBuf },

    #[error("'{}' pipeline not found", .path.display())]
    PipelineNotFound { path: PathBuf },
}

/// Users write scalar config values both bare and as one-element lists;
/// accept either.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }

    fn into_scalar(self) -> Option<T> {
        match self {
            OneOrMany::One(value) => Some(value),
            OneOrMany::Many(values) => values.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    experiment: OneOrMany<String>,
    pipeline: OneOrMany<String>,
    location: OneOrMany<String>,
    #[serde(rename = "commands location")]
    commands_location: OneOrMany<String>,
    #[serde(default)]
    chunk: Option<OneOrMany<u64>>,
    #[serde(rename = "add plate", default)]
    add_plate: Option<AddPlateRaw>,
    #[serde(rename = "remove plate", default)]
    remove_plate: Option<OneOrMany<String>>,
    #[serde(rename = "new ix", default)]
    new_ix: Option<bool>,
    #[serde(rename = "join files", default)]
    join_files: Option<OneOrMany<String>>,
    #[serde(rename = "transfer to", default)]
    transfer_to: Option<OneOrMany<String>>,
}

/// The `add plate` value is written either as a single mapping or as a
/// sequence of one-key mappings; both spell an experiment plus plates.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AddPlateRaw {
    Single(AddPlateFields),
    Pieces(Vec<AddPlateFields>),
}

#[derive(Debug, Default, Deserialize)]
struct AddPlateFields {
    #[serde(default)]
    experiment: Option<String>,
    #[serde(default)]
    plates: Option<OneOrMany<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPlate {
    pub experiment: PathBuf,
    pub plates: Vec<String>,
}

/// A validated run configuration.
#[derive(Debug)]
pub struct Config {
    pub experiment: PathBuf,
    pub pipeline: PathBuf,
    pub location: PathBuf,
    pub commands_location: PathBuf,
    pub chunk: Option<NonZeroUsize>,
    pub add_plate: Option<AddPlate>,
    pub remove_plate: Option<Vec<String>>,
    pub layout: PathLayout,
    pub join_files: Vec<String>,
    pub transfer_to: Option<PathBuf>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file '{}'", path.display()))?;
        Config::parse(&text, path)
    }

    fn parse(text: &str, path: &Path) -> Result<Config> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .with_context(|| format!("invalid YAML in '{}'", path.display()))?;
        check_keys(&value, path)?;
        let raw: RawConfig = serde_yaml::from_value(value)
            .with_context(|| format!("invalid configuration in '{}'", path.display()))?;

        let pipeline = PathBuf::from(
            raw.pipeline
                .into_scalar()
                .context("'pipeline' must not be an empty list")?,
        );
        let pipeline = pipeline
            .canonicalize()
            .ok()
            .filter(|p| p.is_file())
            .ok_or(ConfigError::PipelineNotFound { path: pipeline })?;

        let chunk = match raw.chunk {
            None => None,
            Some(value) => {
                let job_size = value
                    .into_scalar()
                    .context("'chunk' must not be an empty list")?;
                Some(
                    usize::try_from(job_size)
                        .ok()
                        .and_then(NonZeroUsize::new)
                        .context("'chunk' must be a positive integer")?,
                )
            }
        };

        Ok(Config {
            experiment: raw
                .experiment
                .into_scalar()
                .context("'experiment' must not be an empty list")?
                .into(),
            pipeline,
            location: raw
                .location
                .into_scalar()
                .context("'location' must not be an empty list")?
                .into(),
            commands_location: raw
                .commands_location
                .into_scalar()
                .context("'commands location' must not be an empty list")?
                .into(),
            chunk,
            add_plate: raw.add_plate.map(normalize_add_plate).transpose()?,
            remove_plate: raw.remove_plate.map(OneOrMany::into_vec),
            layout: PathLayout::from_new_ix(raw.new_ix.unwrap_or(false)),
            join_files: raw.join_files.map(OneOrMany::into_vec).unwrap_or_default(),
            transfer_to: raw
                .transfer_to
                .and_then(OneOrMany::into_scalar)
                .map(PathBuf::from),
        })
    }
}

/// Collect every unknown top-level key so the user fixes the file once,
/// not once per key.
fn check_keys(value: &serde_yaml::Value, path: &Path) -> Result<()> {
    let mapping = value.as_mapping().ok_or_else(|| ConfigError::NotAMapping {
        path: path.to_path_buf(),
    })?;
    let mut bad: Vec<String> = mapping
        .keys()
        .map(|key| match key.as_str() {
            Some(s) => s.to_string(),
            None => format!("{key:?}"),
        })
        .filter(|key| !VALID_KEYS.contains(&key.as_str()))
        .collect();
    if !bad.is_empty() {
        bad.sort();
        return Err(ConfigError::UnrecognizedKeys { keys: bad }.into());
    }
    Ok(())
}

fn normalize_add_plate(raw: AddPlateRaw) -> Result<AddPlate> {
    let mut experiment = None;
    let mut plates = None;
    let pieces = match raw {
        AddPlateRaw::Single(fields) => vec![fields],
        AddPlateRaw::Pieces(fields) => fields,
    };
    for piece in pieces {
        if let Some(value) = piece.experiment {
            experiment = Some(value);
        }
        if let Some(value) = piece.plates {
            plates = Some(value.into_vec());
        }
    }
    Ok(AddPlate {
        experiment: experiment
            .context("'add plate' requires an 'experiment' entry")?
            .into(),
        plates: plates.context("'add plate' requires a 'plates' entry")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Minimal valid config, with a pipeline file that exists.
    fn base_config(tmp: &TempDir) -> String {
        let pipeline = tmp.path().join("example.cppipe");
        std::fs::write(&pipeline, "pipeline\n").unwrap();
        format!(
            "experiment: /exports/experiment-1\n\
             pipeline: {}\n\
             location: /scratch/run\n\
             commands location: /scratch/run_commands\n",
            pipeline.display()
        )
    }

    fn parse(text: &str) -> Result<Config> {
        Config::parse(text, Path::new("config.yaml"))
    }

    #[test]
    fn minimal_config() {
        let tmp = TempDir::new().unwrap();
        let cfg = parse(&base_config(&tmp)).unwrap();
        assert_eq!(cfg.experiment, PathBuf::from("/exports/experiment-1"));
        assert_eq!(cfg.location, PathBuf::from("/scratch/run"));
        assert_eq!(cfg.chunk, None);
        assert_eq!(cfg.layout, PathLayout::Legacy);
        assert!(cfg.join_files.is_empty());
        assert_eq!(cfg.transfer_to, None);
    }

    #[test]
    fn full_config() {
        let tmp = TempDir::new().unwrap();
        let text = format!(
            "{}chunk: 46\n\
             new ix: true\n\
             remove plate: [plate_3, plate_4]\n\
             add plate:\n\
             - experiment: /exports/experiment-2\n\
             - plates:\n\
             \x20 - plate_9\n\
             join files: [Image.csv, Cells.csv]\n\
             transfer to: /archive/run\n",
            base_config(&tmp)
        );
        let cfg = parse(&text).unwrap();
        assert_eq!(cfg.chunk, NonZeroUsize::new(46));
        assert_eq!(cfg.layout, PathLayout::NewIx);
        assert_eq!(
            cfg.remove_plate,
            Some(vec!["plate_3".to_string(), "plate_4".to_string()])
        );
        assert_eq!(
            cfg.add_plate,
            Some(AddPlate {
                experiment: PathBuf::from("/exports/experiment-2"),
                plates: vec!["plate_9".to_string()],
            })
        );
        assert_eq!(cfg.join_files, ["Image.csv", "Cells.csv"]);
        assert_eq!(cfg.transfer_to, Some(PathBuf::from("/archive/run")));
    }

    #[test]
    fn scalar_or_singleton_list() {
        let tmp = TempDir::new().unwrap();
        let pipeline = tmp.path().join("example.cppipe");
        std::fs::write(&pipeline, "pipeline\n").unwrap();
        let text = format!(
            "experiment:\n\
             - /exports/experiment-1\n\
             pipeline: {}\n\
             location: [/scratch/run]\n\
             commands location: /scratch/run_commands\n",
            pipeline.display()
        );
        let cfg = parse(&text).unwrap();
        assert_eq!(cfg.experiment, PathBuf::from("/exports/experiment-1"));
        assert_eq!(cfg.location, PathBuf::from("/scratch/run"));
    }

    #[test]
    fn unknown_keys_are_collected_into_one_error() {
        let tmp = TempDir::new().unwrap();
        let text = format!(
            "{}chnk: 46\ntransfer too: /archive\n",
            base_config(&tmp)
        );
        let err = parse(&text).unwrap_err();
        match err.downcast_ref::<ConfigError>() {
            Some(ConfigError::UnrecognizedKeys { keys }) => {
                assert_eq!(keys, &["chnk", "transfer too"]);
            }
            other => panic!("expected UnrecognizedKeys, got {other:?}"),
        }
    }

    #[test]
    fn missing_pipeline_file() {
        let text = "experiment: /exports/experiment-1\n\
                    pipeline: /no/such/pipeline.cppipe\n\
                    location: /scratch/run\n\
                    commands location: /scratch/run_commands\n";
        let err = parse(text).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::PipelineNotFound { .. })
        ));
    }

    #[test]
    fn zero_chunk_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let text = format!("{}chunk: 0\n", base_config(&tmp));
        let err = parse(&text).unwrap_err();
        assert!(err.to_string().contains("positive integer"));
    }

    #[test]
    fn missing_required_key() {
        let text = "experiment: /exports/experiment-1\n";
        assert!(parse(text).is_err());
    }
}
