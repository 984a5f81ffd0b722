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

use std::io;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use nix::mount::{MntFlags, MsFlags};

/// Kernel mount operations used by the node service.
pub trait Mounter: Send + Sync {
    /// Mounts an overlay of `lower` (top first) with `upper`/`work` onto `target`.
    fn mount_overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> io::Result<()>;

    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;

    fn is_mount_point(&self, path: &Path) -> io::Result<bool>;
}

pub(crate) fn overlay_options(lower: &[PathBuf], upper: &Path, work: &Path) -> String {
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.iter().map(|p| p.display()).join(":"),
        upper.display(),
        work.display()
    )
}

/// Mounts through the host kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMounter;

fn errno(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

impl Mounter for SystemMounter {
    fn mount_overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> io::Result<()> {
        let options = overlay_options(lower, upper, work);
        nix::mount::mount(
            Some("overlay"),
            target,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(errno)
    }

    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> io::Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(errno)?;
        if readonly {
            // MS_RDONLY is ignored on the initial bind.
            let remount = nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            );
            if let Err(e) = remount {
                let _ = nix::mount::umount2(target, MntFlags::MNT_DETACH);
                return Err(errno(e));
            }
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        match nix::mount::umount2(target, MntFlags::empty()) {
            Ok(()) | Err(nix::Error::EINVAL) | Err(nix::Error::ENOENT) => Ok(()),
            Err(e) => Err(errno(e)),
        }
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        let path = match std::fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        Ok(mount_points(&mountinfo).any(|p| p == path))
    }
}

/// Mount points listed in a mountinfo table, with octal escapes decoded.
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|raw| PathBuf::from(unescape(raw)))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let code: String = chars.clone().take(3).collect();
            if code.len() == 3 {
                if let Ok(v) = u8::from_str_radix(&code, 8) {
                    out.push(v as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 0:50 / /var/lib/kubelet/pods/p1/volumes/oneagent rw,relatime - overlay overlay rw,lowerdir=/a
99 22 0:51 / /mnt/with\\040space rw - tmpfs tmpfs rw
";

    #[test]
    fn parses_mount_points() {
        let points: Vec<PathBuf> = mount_points(MOUNTINFO).collect();
        assert_eq!(
            points,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/var/lib/kubelet/pods/p1/volumes/oneagent"),
                PathBuf::from("/mnt/with space"),
            ]
        );
    }

    #[test]
    fn builds_overlay_options() {
        let opts = overlay_options(
            &[PathBuf::from("/cfg"), PathBuf::from("/bin/1.2")],
            Path::new("/run/v1/var"),
            Path::new("/run/v1/work"),
        );
        assert_eq!(
            opts,
            "lowerdir=/cfg:/bin/1.2,upperdir=/run/v1/var,workdir=/run/v1/work"
        );
    }

    #[test]
    fn missing_path_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!SystemMounter.is_mount_point(&dir.path().join("nope")).unwrap());
    }
}
