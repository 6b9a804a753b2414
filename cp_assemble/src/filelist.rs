//! Discover plate directories and the image files inside them.

use anyhow::{Context, Result};
use cp_types::error::ScanError;
use cp_types::layout::PathLayout;
use cp_types::parse;
use log::debug;
use std::path::{Path, PathBuf};

/// How [`files_from_plate`] scans and post-processes image paths.
#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Image file extension, including the leading dot.
    pub extension: String,
    /// Drop thumbnails and non-image files.
    pub clean: bool,
    /// Truncate each path to its plate-relative tail so staged paths stay
    /// short and layout-relative; when false, paths are absolutized.
    pub truncate: bool,
    /// Escape whitespace for safe shell embedding.
    pub sanitise: bool,
    pub layout: PathLayout,
}

impl Default for ScanOptions {
    fn default() -> ScanOptions {
        ScanOptions {
            extension: ".tif".to_string(),
            clean: true,
            truncate: true,
            sanitise: false,
            layout: PathLayout::Legacy,
        }
    }
}

impl ScanOptions {
    pub fn with_layout(layout: PathLayout) -> ScanOptions {
        ScanOptions {
            layout,
            ..ScanOptions::default()
        }
    }
}

/// Absolute paths of all plate directories directly under an experiment
/// directory, sorted by name. Non-directory children are skipped.
pub fn paths_to_plates(experiment_dir: &Path) -> Result<Vec<PathBuf>> {
    if !experiment_dir.is_dir() {
        return Err(ScanError::NotFound {
            path: experiment_dir.to_path_buf(),
        }
        .into());
    }
    let experiment_dir = experiment_dir
        .canonicalize()
        .with_context(|| format!("resolving '{}'", experiment_dir.display()))?;
    let mut plates = Vec::new();
    for entry in std::fs::read_dir(&experiment_dir)
        .with_context(|| format!("reading '{}'", experiment_dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            plates.push(path);
        }
    }
    plates.sort();
    Ok(plates)
}

/// All proper image files in a plate directory.
///
/// Images sit at a fixed depth below the plate directory; the depth and the
/// truncation length both come from the layout descriptor.
pub fn files_from_plate(plate_dir: &Path, opts: &ScanOptions) -> Result<Vec<String>> {
    if !plate_dir.is_dir() {
        return Err(ScanError::NotFound {
            path: plate_dir.to_path_buf(),
        }
        .into());
    }
    let pattern = format!(
        "{}{}{}",
        plate_dir.display(),
        "/*".repeat(opts.layout.glob_depth()),
        opts.extension
    );
    let mut files: Vec<String> = glob::glob(&pattern)
        .with_context(|| format!("bad glob pattern '{pattern}'"))?
        .filter_map(|entry| entry.ok().map(|p| p.to_string_lossy().into_owned()))
        .collect();
    files.sort();
    debug!("glob '{}' matched {} files", pattern, files.len());
    if opts.clean {
        files = parse::clean(files, &opts.extension);
    }
    if opts.truncate {
        files = files
            .iter()
            .map(|f| truncate_path(f, opts.layout.truncate_len()))
            .collect();
    } else {
        files = files
            .iter()
            .map(|f| {
                std::fs::canonicalize(f)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| f.clone())
            })
            .collect();
    }
    if opts.sanitise {
        files = files.iter().map(|f| sanitise_filename(f)).collect();
    }
    if files.is_empty() {
        return Err(ScanError::NoImages {
            path: plate_dir.to_path_buf(),
        }
        .into());
    }
    Ok(files)
}

/// Keep the last `keep` segments of a path, joined with `/`.
fn truncate_path(path: &str, keep: usize) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let start = segments.len().saturating_sub(keep);
    segments[start..].join("/")
}

/// Escape whitespace so a path survives shell word-splitting.
pub fn sanitise_filename(path: &str) -> String {
    path.replace(' ', "\\ ")
}

/// Filter a plate path list by plate name. `remove` drops the named plates;
/// otherwise only the named plates are kept.
pub fn exclude_plates(plate_paths: &[PathBuf], names: &[String], remove: bool) -> Vec<PathBuf> {
    plate_paths
        .iter()
        .filter(|path| {
            let is_named = path
                .file_name()
                .map(|n| names.iter().any(|x| n == x.as_str()))
                .unwrap_or(false);
            if remove {
                !is_named
            } else {
                is_named
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};
    use tempfile::TempDir;

    fn plate_with_images(root: &Path, plate: &str, files: &[&str]) -> PathBuf {
        let plate_dir = root.join(plate);
        let leaf = plate_dir.join("2015-07-31/4016");
        create_dir_all(&leaf).unwrap();
        for f in files {
            File::create(leaf.join(f)).unwrap();
        }
        plate_dir
    }

    #[test]
    fn plates_are_discovered_sorted() {
        let tmp = TempDir::new().unwrap();
        for name in ["plate_2", "plate_1", "plate_3"] {
            create_dir_all(tmp.path().join(name)).unwrap();
        }
        File::create(tmp.path().join("stray_file.txt")).unwrap();
        let plates = paths_to_plates(tmp.path()).unwrap();
        let names: Vec<_> = plates
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["plate_1", "plate_2", "plate_3"]);
    }

    #[test]
    fn missing_experiment_dir_is_an_error() {
        let err = paths_to_plates(Path::new("/no/such/dir")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::NotFound { .. })
        ));
    }

    #[test]
    fn files_are_truncated_and_cleaned() {
        let tmp = TempDir::new().unwrap();
        let plate_dir = plate_with_images(
            tmp.path(),
            "test-plate-1",
            &[
                "val screen_B02_s1_w1AA.tif",
                "val screen_B02_s1_w1_thumbAB.tif",
                "plate_info.HTD",
            ],
        );
        let files = files_from_plate(&plate_dir, &ScanOptions::default()).unwrap();
        assert_eq!(
            files,
            ["test-plate-1/2015-07-31/4016/val screen_B02_s1_w1AA.tif"]
        );
    }

    #[test]
    fn sanitise_escapes_spaces() {
        let tmp = TempDir::new().unwrap();
        let plate_dir =
            plate_with_images(tmp.path(), "test-plate-1", &["val screen_B02_s1_w1AA.tif"]);
        let opts = ScanOptions {
            sanitise: true,
            ..ScanOptions::default()
        };
        let files = files_from_plate(&plate_dir, &opts).unwrap();
        assert_eq!(
            files,
            ["test-plate-1/2015-07-31/4016/val\\ screen_B02_s1_w1AA.tif"]
        );
    }

    #[test]
    fn empty_plate_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let plate_dir = tmp.path().join("empty-plate");
        create_dir_all(&plate_dir).unwrap();
        let err = files_from_plate(&plate_dir, &ScanOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::NoImages { .. })
        ));
    }

    #[test]
    fn exclude_plates_both_directions() {
        let all: Vec<PathBuf> = (1..=4).map(|i| PathBuf::from(format!("/x/plate_{i}"))).collect();
        let drop: Vec<String> = vec!["plate_3".to_string(), "plate_4".to_string()];
        let kept = exclude_plates(&all, &drop, true);
        assert_eq!(kept, vec![PathBuf::from("/x/plate_1"), PathBuf::from("/x/plate_2")]);
        let only = exclude_plates(&all, &drop, false);
        assert_eq!(only, vec![PathBuf::from("/x/plate_3"), PathBuf::from("/x/plate_4")]);
    }
}
