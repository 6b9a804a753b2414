// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms,
    unused
)]

pub mod config;

use anyhow::Result;
use config::Config;
use cp_assemble::admission::AdmissionPolicy;
use cp_assemble::join;
use cp_assemble::plate::{CommandParams, PlateStore};
use cp_assemble::scripts::{self, GenerateScriptsConfig, HexTokenSource};
use itertools::Itertools;
use log::info;
use std::path::Path;

/// The `generate` operation: scan, chunk, build tables and commands, then
/// render the submission scripts. Any error leaves nothing submittable.
pub fn run_generate(config_path: &Path) -> Result<()> {
    info!("reading configuration from '{}'", config_path.display());
    let cfg = Config::from_file(config_path)?;

    let mut store = PlateStore::new(cfg.layout);
    store.add_experiment(&cfg.experiment)?;
    if let Some(plates) = &cfg.remove_plate {
        store.remove_plates(plates)?;
    }
    if let Some(add) = &cfg.add_plate {
        store.add_plates(&add.experiment, &add.plates)?;
    }
    if let Some(job_size) = cfg.chunk {
        store.chunk(job_size)?;
    }

    let set = store.create_commands(&CommandParams {
        pipeline: &cfg.pipeline,
        location: &cfg.location,
        commands_location: &cfg.commands_location,
        job_size: cfg.chunk,
    })?;
    info!(
        "saved {} commands per phase at '{}'",
        set.len(),
        cfg.commands_location.display()
    );

    let script_cfg = GenerateScriptsConfig {
        commands_location: &cfg.commands_location,
        location: &cfg.location,
        join_patterns: &cfg.join_files,
        transfer_to: cfg.transfer_to.as_deref(),
        policy: AdmissionPolicy::default(),
    };
    let mut tokens = HexTokenSource;
    let generated =
        scripts::make_submission_scripts(&script_cfg, &scripts::run_stamp(), &mut tokens)?;
    info!(
        "run '{}' to submit the jobs in dependency order",
        generated.master.display()
    );
    Ok(())
}

/// The standalone `join` operation over an existing run's output tree.
pub fn run_join(location: &Path, patterns: &[String]) -> Result<()> {
    let raw_data = location.join("raw_data");
    let plates = join::discover_plate_names(&raw_data)?;
    info!("joining output for {} plates", plates.len());
    let summary = join::join_plate_files(&plates, &raw_data, patterns)?;
    let joined = summary.values().map(|per_pattern| per_pattern.len()).sum::<usize>();
    info!("wrote {joined} joined files");
    Ok(())
}

/// Print an error chain, cause by cause.
pub fn print_error_chain(err: &anyhow::Error) {
    eprintln!("ERROR: {}", err.chain().join("\n\tCaused by: "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};
    use tempfile::TempDir;

    #[test]
    fn generate_then_join_end_to_end() {
        let tmp = TempDir::new().unwrap();
        // one plate of 2 wells x 1 site x 2 channels
        let leaf = tmp.path().join("experiment-1/plate_1/2015-07-31/4016");
        create_dir_all(&leaf).unwrap();
        for well in ["B02", "B03"] {
            for channel in 1..=2 {
                File::create(leaf.join(format!("screen_{well}_s1_w{channel}AA.tif"))).unwrap();
            }
        }
        let pipeline = tmp.path().join("example.cppipe");
        std::fs::write(&pipeline, "pipeline\n").unwrap();
        let location = tmp.path().join("run");
        let commands_location = tmp.path().join("run_commands");
        let config = tmp.path().join("config.yaml");
        std::fs::write(
            &config,
            format!(
                "experiment: {}\n\
                 pipeline: {}\n\
                 location: {}\n\
                 commands location: {}\n\
                 chunk: 96\n",
                tmp.path().join("experiment-1").display(),
                pipeline.display(),
                location.display(),
                commands_location.display(),
            ),
        )
        .unwrap();

        run_generate(&config).unwrap();

        for name in ["staging", "cp_commands", "destaging"] {
            let text =
                std::fs::read_to_string(commands_location.join(format!("{name}.txt"))).unwrap();
            assert_eq!(text.lines().count(), 1, "{name} should hold one job unit");
        }
        // three phase scripts plus the master submit script
        let scripts = std::fs::read_dir(&commands_location)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".sh"))
            .count();
        assert_eq!(scripts, 4);
        assert!(location.join("loaddata/plate_1_0.csv").is_file());
        assert!(location.join("filelist/plate_1_0").is_file());

        // fake a finished cluster run, then join its output
        let out_dir = location.join("raw_data/plate_1_0");
        create_dir_all(&out_dir).unwrap();
        std::fs::write(out_dir.join("Image.csv"), "ImageNumber,Count\n1,5\n").unwrap();
        run_join(&location, &["Image.csv".to_string()]).unwrap();
        assert!(location
            .join("raw_data/joined_files/plate_1_Image.csv")
            .is_file());
    }
}
