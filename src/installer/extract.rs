// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{Error, IoContext};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const S_IFBLK: u32 = 0o060000;
const S_IFCHR: u32 = 0o020000;

const AGENT_CONF_MODE: u32 = 0o660;
const DEFAULT_FILE_MODE: u32 = 0o644;

static VERSION_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+\.\d+-\d+$").expect("static regex"));

/// Resolves an archive entry name below `root`. Returns the absolute path and
/// the cleaned relative one, or an error if the entry would escape `root`.
pub(super) fn safe_join(root: &Path, name: &str) -> Result<(PathBuf, PathBuf), Error> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(c) => rel.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !rel.pop() {
                    return Err(Error::IllegalPath(root.join(name).display().to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::IllegalPath(name.to_string()));
            }
        }
    }
    Ok((root.join(&rel), rel))
}

/// Anything below an `agent/conf` directory is rewritten by the agent at runtime.
pub(super) fn is_agent_conf(rel: &Path) -> bool {
    let parts: Vec<_> = rel.components().collect();
    parts.windows(2).enumerate().any(|(i, w)| {
        w[0] == Component::Normal(OsStr::new("agent"))
            && w[1] == Component::Normal(OsStr::new("conf"))
            && parts.len() > i + 2
    })
}

fn file_mode(rel: &Path, archived: Option<u32>) -> u32 {
    if is_agent_conf(rel) {
        return AGENT_CONF_MODE;
    }
    archived
        .map(|m| m & 0o7777)
        .filter(|m| *m != 0)
        .unwrap_or(DEFAULT_FILE_MODE)
}

/// Extractor holds the canonical root so every write can be checked against it,
/// including writes through links created by earlier entries.
struct Extractor {
    root: PathBuf,
    canonical_root: PathBuf,
}

impl Extractor {
    fn new(root: &Path) -> Result<Self, Error> {
        fs::create_dir_all(root).context("failed to create", root)?;
        let canonical_root = root.canonicalize().context("failed to resolve", root)?;
        Ok(Extractor {
            root: root.to_path_buf(),
            canonical_root,
        })
    }

    fn is_inside(&self, path: &Path) -> bool {
        path.canonicalize()
            .is_ok_and(|resolved| resolved.starts_with(&self.canonical_root))
    }

    /// Creates `rel` below the root one component at a time. A component that is a
    /// symlink is only followed when it resolves to a directory inside the root.
    fn create_dir(&self, rel: &Path) -> Result<PathBuf, Error> {
        let mut current = self.root.clone();
        for component in rel.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    if !self.is_inside(&current) || !current.is_dir() {
                        return Err(Error::IllegalPath(current.display().to_string()));
                    }
                }
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(Error::IllegalPath(current.display().to_string())),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&current).context("failed to create", &current)?;
                }
                Err(e) => {
                    return Err(Error::io(format!("failed to inspect {}", current.display()), e));
                }
            }
        }
        Ok(current)
    }

    /// Makes room for a new entry at `rel`. Whatever non-directory sits there already is
    /// unlinked so neither a symlink nor a hard link is ever written through.
    fn prepare_entry(&self, rel: &Path) -> Result<PathBuf, Error> {
        let parent = self.create_dir(rel.parent().unwrap_or(Path::new("")))?;
        let Some(name) = rel.file_name() else {
            return Err(Error::IllegalPath(self.root.join(rel).display().to_string()));
        };
        let dest = parent.join(name);
        if let Ok(meta) = fs::symlink_metadata(&dest) {
            if !meta.is_dir() {
                fs::remove_file(&dest).context("failed to replace", &dest)?;
            }
        }
        Ok(dest)
    }

    fn write_file(&self, rel: &Path, mode: Option<u32>, content: &mut impl Read) -> Result<(), Error> {
        let dest = self.prepare_entry(rel)?;
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .context("failed to create", &dest)?;
        io::copy(content, &mut out).context("failed to write", &dest)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(file_mode(rel, mode)))
            .context("failed to set permissions on", &dest)
    }

    fn symlink(&self, link_target: &Path, rel: &Path) -> Result<(), Error> {
        let dest = self.prepare_entry(rel)?;
        if let Err(e) = std::os::unix::fs::symlink(link_target, &dest) {
            debug!(path=%dest.display(), "skipping symlink: {e}");
        }
        Ok(())
    }

    fn hard_link(&self, link_name: &str, rel: &Path) -> Result<(), Error> {
        let (source, _) = safe_join(&self.root, link_name)?;
        if fs::symlink_metadata(&source).is_ok() && !self.is_inside(&source) {
            return Err(Error::IllegalPath(link_name.to_string()));
        }
        let dest = self.prepare_entry(rel)?;
        if let Err(e) = fs::hard_link(&source, &dest) {
            debug!(path=%dest.display(), "skipping hard link: {e}");
        }
        Ok(())
    }
}

/// Unpacks a zip archive into `target_dir`. Reading the central directory
/// doubles as validation of the download.
pub(super) fn extract_zip(archive: &Path, target_dir: &Path) -> Result<(), Error> {
    let file = File::open(archive).context("failed to open", archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let extractor = Extractor::new(target_dir)?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        let (_, rel) = safe_join(target_dir, &name)?;
        let mode = entry.unix_mode();
        let kind = mode.map(|m| m & S_IFMT);
        if matches!(kind, Some(S_IFBLK) | Some(S_IFCHR)) {
            return Err(Error::DeviceEntry(name));
        }
        if entry.is_dir() {
            extractor.create_dir(&rel)?;
            continue;
        }
        if kind == Some(S_IFLNK) {
            let mut link = String::new();
            entry
                .read_to_string(&mut link)
                .context("failed to read link", archive)?;
            extractor.symlink(Path::new(&link), &rel)?;
            continue;
        }
        extractor.write_file(&rel, mode, &mut entry)?;
    }
    Ok(())
}

/// Unpacks a gzip compressed tar layer into `target_dir`.
pub(super) fn extract_tar_gzip(layer: &Path, target_dir: &Path) -> Result<(), Error> {
    let file = File::open(layer).context("failed to open", layer)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let extractor = Extractor::new(target_dir)?;
    let entries = archive.entries().context("failed to read layer", layer)?;
    for entry in entries {
        let mut entry = entry.context("failed to read layer", layer)?;
        let name = entry
            .path()
            .context("invalid entry in", layer)?
            .to_string_lossy()
            .into_owned();
        let (_, rel) = safe_join(target_dir, &name)?;
        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode().ok();
        if kind.is_dir() {
            extractor.create_dir(&rel)?;
        } else if kind.is_symlink() {
            let link = entry
                .link_name()
                .context("invalid link in", layer)?
                .map(|l| l.into_owned())
                .unwrap_or_default();
            extractor.symlink(&link, &rel)?;
        } else if kind.is_hard_link() {
            let link = entry
                .link_name()
                .context("invalid link in", layer)?
                .map(|l| l.to_string_lossy().into_owned())
                .unwrap_or_default();
            extractor.hard_link(&link, &rel)?;
        } else if kind.is_file() {
            extractor.write_file(&rel, mode, &mut entry)?;
        } else {
            debug!("skipping special file: {name}");
        }
    }
    Ok(())
}

/// Points `agent/bin/current` at the version directory shipped in the package.
pub(super) fn create_current_symlink(target_dir: &Path) -> Result<(), Error> {
    let bin_dir = target_dir.join("agent").join("bin");
    let current = bin_dir.join("current");
    if fs::symlink_metadata(&current).is_ok() {
        debug!(location=%current.display(), "symlink already exists");
        return Ok(());
    }
    let Some(version_dir) = find_version_dir(&bin_dir)? else {
        warn!(dir=%bin_dir.display(), "no version directory found, not creating current symlink");
        return Ok(());
    };
    let relative = version_dir
        .strip_prefix(&bin_dir)
        .map(Path::to_path_buf)
        .unwrap_or(version_dir);
    info!(points_to=%relative.display(), location=%current.display(), "creating symlink");
    std::os::unix::fs::symlink(&relative, &current).context("failed to create symlink", &current)
}

fn find_version_dir(bin_dir: &Path) -> Result<Option<PathBuf>, Error> {
    let mut queue = vec![bin_dir.to_path_buf()];
    while let Some(dir) = queue.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io(format!("failed to read {}", dir.display()), e)),
        };
        let mut children: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        children.sort();
        for child in &children {
            let matches = child
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| VERSION_DIR.is_match(n));
            if matches {
                return Ok(Some(child.clone()));
            }
        }
        // Depth first, keeping sorted order.
        queue.extend(children.into_iter().rev());
    }
    Ok(None)
}
