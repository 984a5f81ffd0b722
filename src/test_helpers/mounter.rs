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
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::csi::mount::{Mounter, overlay_options};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeMount {
    Overlay { target: PathBuf, options: String },
    Bind {
        source: PathBuf,
        target: PathBuf,
        readonly: bool,
    },
}

impl FakeMount {
    pub fn target(&self) -> &Path {
        match self {
            FakeMount::Overlay { target, .. } | FakeMount::Bind { target, .. } => target,
        }
    }
}

/// In-memory mount table.
#[derive(Debug, Default)]
pub struct FakeMounter {
    mounts: Mutex<Vec<FakeMount>>,
    failing_overlays: AtomicUsize,
    failing_binds: AtomicUsize,
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FakeMounter {
    pub fn fail_next_overlays(&self, n: usize) {
        self.failing_overlays.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_binds(&self, n: usize) {
        self.failing_binds.store(n, Ordering::SeqCst);
    }

    pub fn mounts(&self) -> Vec<FakeMount> {
        self.mounts.lock().unwrap().clone()
    }
}

impl Mounter for FakeMounter {
    fn mount_overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        target: &Path,
    ) -> io::Result<()> {
        if take(&self.failing_overlays) {
            return Err(io::Error::other("injected overlay failure"));
        }
        self.mounts.lock().unwrap().push(FakeMount::Overlay {
            target: target.to_path_buf(),
            options: overlay_options(lower, upper, work),
        });
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> io::Result<()> {
        if take(&self.failing_binds) {
            return Err(io::Error::other("injected bind failure"));
        }
        self.mounts.lock().unwrap().push(FakeMount::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            readonly,
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        self.mounts.lock().unwrap().retain(|m| m.target() != target);
        Ok(())
    }

    fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        Ok(self.mounts.lock().unwrap().iter().any(|m| m.target() == path))
    }
}
