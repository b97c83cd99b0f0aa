//! Unpacking downloaded archives and choosing which files to keep.
//!
//! Filesystem work (zip/tar extraction, directory walks) is kept apart from
//! the filtering decisions: the filters are pure functions over a sequence of
//! [`TreeEntry`] values, so they can be exercised with synthetic trees.
//! Everything here is blocking; the engine calls it from
//! `tokio::task::spawn_blocking`.

use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::FilterRules;
use crate::contract::{RunArtifact, WorkflowRun};
use crate::error::{Error, Result};
use crate::model::Variant;

/// One node of an extracted tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub is_file: bool,
}

impl TreeEntry {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_file: true,
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_file: false,
        }
    }
}

/// Lazily walk everything below `root` (not `root` itself), in file-name order.
/// Symlinks, `root` included, are never followed and never count as regular files.
pub fn walk_tree(root: impl AsRef<Path>) -> impl Iterator<Item = Result<TreeEntry>> {
    WalkDir::new(root.as_ref())
        .min_depth(1)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            Ok(TreeEntry {
                is_file: entry.file_type().is_file(),
                path: entry.into_path(),
            })
        })
}

/// Runs built from the native workflow are never candidates.
pub fn is_native_run(run: &WorkflowRun, rules: &FilterRules) -> bool {
    run.path.contains(&rules.native_path_marker)
}

/// Decide whether a run artifact is mirrored, and as which variant.
///
/// Expired artifacts, non-default toolchain builds and anything that is not a
/// release-configuration build are rejected.
pub fn accept_run_artifact(artifact: &RunArtifact, rules: &FilterRules) -> Option<Variant> {
    if artifact.expired {
        return None;
    }
    let name = artifact.name.to_lowercase();
    if name.contains(&rules.excluded_toolchain_marker.to_lowercase()) {
        return None;
    }
    if !name.contains(&rules.required_config_marker.to_lowercase()) {
        return None;
    }
    Some(Variant::from_compat_flag(
        name.contains(&rules.compat_marker.to_lowercase()),
    ))
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|allowed| allowed == ext))
}

/// Regular files whose extension is allowed for `variant`.
pub fn retain_builtin_files<'a, I>(
    entries: I,
    variant: Variant,
    rules: &'a FilterRules,
) -> impl Iterator<Item = PathBuf> + 'a
where
    I: IntoIterator<Item = TreeEntry>,
    I::IntoIter: 'a,
{
    let extensions = match variant {
        Variant::Default => &rules.default_extensions,
        Variant::Compat => &rules.compat_extensions,
    };
    entries
        .into_iter()
        .filter(|entry| entry.is_file)
        .filter(move |entry| has_extension(&entry.path, extensions))
        .map(|entry| entry.path)
}

pub fn retain_regular_files<I>(entries: I) -> impl Iterator<Item = PathBuf>
where
    I: IntoIterator<Item = TreeEntry>,
{
    entries
        .into_iter()
        .filter(|entry| entry.is_file)
        .map(|entry| entry.path)
}

pub fn extract_zip(archive: &[u8], dest: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| Error::Archive(format!("not a readable zip archive: {e}")))?;
    zip.extract(dest)
        .map_err(|e| Error::Archive(format!("failed to extract zip into {}: {e}", dest.display())))?;
    debug!(dest = %dest.display(), entries = zip.len(), "Extracted zip archive");
    Ok(())
}

pub fn extract_tar_gz(reader: impl Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive
        .unpack(dest)
        .map_err(|e| Error::Archive(format!("failed to extract tar.gz into {}: {e}", dest.display())))?;
    debug!(dest = %dest.display(), "Extracted tar.gz archive");
    Ok(())
}

/// The first file directly inside `dir` whose name ends with `suffix`.
pub fn find_secondary_archive(dir: &Path, suffix: &str) -> Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(suffix) {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Unpack a run artifact (a zip wrapping one tar.gz) below `workdir` and
/// return the files to mirror.
///
/// `Ok(None)` means the artifact holds no secondary archive and is skipped.
pub fn unpack_run_artifact(
    blob: &[u8],
    workdir: &Path,
    variant: Variant,
    rules: &FilterRules,
) -> Result<Option<Vec<PathBuf>>> {
    let outer = workdir.join("outer");
    fs::create_dir_all(&outer)?;
    extract_zip(blob, &outer)?;

    let Some(inner_archive) = find_secondary_archive(&outer, &rules.secondary_archive_suffix)? else {
        warn!(dir = %outer.display(), "No secondary archive found in artifact");
        return Ok(None);
    };

    let inner = workdir.join("extracted");
    fs::create_dir_all(&inner)?;
    extract_tar_gz(fs::File::open(&inner_archive)?, &inner)?;

    let entries = walk_tree(&inner).collect::<Result<Vec<_>>>()?;
    let files: Vec<PathBuf> = retain_builtin_files(entries, variant, rules).collect();
    info!(
        archive = %inner_archive.display(),
        ?variant,
        count = files.len(),
        "Selected files from run artifact"
    );
    Ok(Some(files))
}

/// Unpack a release asset (a tar.gz) below `workdir` and return every regular
/// file found under the configured platform directories, tagged with its variant.
/// Directories that are absent are skipped; the second value reports whether
/// a compatibility directory was present.
pub fn unpack_release_asset(
    blob: &[u8],
    workdir: &Path,
    rules: &FilterRules,
) -> Result<(Vec<(PathBuf, Variant)>, bool)> {
    let root = workdir.join("extracted");
    fs::create_dir_all(&root)?;
    extract_tar_gz(Cursor::new(blob), &root)?;

    let mut files = Vec::new();
    let mut has_compat = false;
    for dir in &rules.release_dirs {
        let path = root.join(&dir.name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                warn!(dir = %dir.name, "Release directory is not a real directory, ignoring");
                continue;
            }
            Err(_) => {
                debug!(dir = %dir.name, "Release directory not present");
                continue;
            }
        }
        let variant = Variant::from_compat_flag(dir.compat);
        has_compat |= dir.compat;
        let entries = walk_tree(&path).collect::<Result<Vec<_>>>()?;
        let before = files.len();
        files.extend(retain_regular_files(entries).map(|file| (file, variant)));
        info!(dir = %dir.name, ?variant, count = files.len() - before, "Selected files from release directory");
    }
    Ok((files, has_compat))
}
