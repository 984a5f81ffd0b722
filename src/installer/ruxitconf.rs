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

use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use super::{Error, IoContext};
use crate::metadata::{RUXIT_CONF_FILE, RUXIT_CONF_SOURCE_FILE};
use crate::processmoduleconfig::ProcessModuleConfig;

type Sections = BTreeMap<String, BTreeMap<String, String>>;

static SECTION_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[(.*)\]").expect("static regex"));

/// Renders `ruxitagentproc.conf` from the pristine copy in `install_dir` into `dest`.
///
/// The shipped file is saved as `_ruxitagentproc.conf` the first time only, so
/// every later render starts from what the package contained.
pub(super) async fn update(
    install_dir: &Path,
    dest: &Path,
    config: &ProcessModuleConfig,
) -> Result<(), Error> {
    let shipped = install_dir.join(RUXIT_CONF_FILE);
    let pristine = install_dir.join(RUXIT_CONF_SOURCE_FILE);
    if !tokio::fs::try_exists(&pristine).await.unwrap_or(false) {
        info!(path=%pristine.display(), "saving original ruxitagentproc.conf");
        tokio::fs::copy(&shipped, &pristine)
            .await
            .context("failed to copy", &shipped)?;
    }
    let source = tokio::fs::read_to_string(&pristine)
        .await
        .context("failed to read", &pristine)?;
    let sections: Sections = config
        .to_map()
        .into_iter()
        .map(|(section, props)| (section, props.into_iter().collect()))
        .collect();
    let merged = merge(&source, sections);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("failed to create", parent)?;
    }
    tokio::fs::write(dest, merged)
        .await
        .context("failed to write", dest)
}

fn section_header(line: &str) -> Option<&str> {
    SECTION_HEADER
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

fn take_section(sections: &mut Sections, section: &str) -> Vec<String> {
    sections
        .remove(section)
        .map(|props| props.into_iter().map(|(k, v)| format!("{k} {v}")).collect())
        .unwrap_or_default()
}

/// Overrides keys of `source` with `sections`. Keys a section does not have yet
/// are appended at its end, ahead of trailing blank lines. Unknown sections go last.
fn merge(source: &str, mut sections: Sections) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blanks: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for line in source.lines() {
        if line.trim().is_empty() {
            blanks.push(line.to_string());
            continue;
        }
        if let Some(header) = section_header(line) {
            if let Some(section) = current.take() {
                out.extend(take_section(&mut sections, &section));
            }
            out.append(&mut blanks);
            current = Some(header.to_string());
            out.push(line.to_string());
            continue;
        }
        out.append(&mut blanks);
        if line.trim_start().starts_with('#') {
            out.push(line.to_string());
            continue;
        }
        let key = line.split_whitespace().next().unwrap_or_default();
        let replacement = current
            .as_ref()
            .and_then(|s| sections.get_mut(s))
            .and_then(|props| props.remove(key));
        match replacement {
            Some(value) => out.push(format!("{key} {value}")),
            None => out.push(line.to_string()),
        }
    }
    if let Some(section) = current.take() {
        out.extend(take_section(&mut sections, &section));
    }
    out.append(&mut blanks);
    for (section, props) in sections {
        if props.is_empty() {
            continue;
        }
        out.push(format!("[{section}]"));
        out.extend(props.into_iter().map(|(k, v)| format!("{k} {v}")));
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processmoduleconfig::ProcessModuleProperty;

    fn sections(entries: &[(&str, &str, &str)]) -> Sections {
        let mut s = Sections::new();
        for (section, key, value) in entries {
            s.entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        s
    }

    const SOURCE: &str = "[general]\n# comment\nkey1 old\nkey2 keep\n\n[other]\nfoo bar\n";

    #[test]
    fn overrides_appends_and_adds_sections() {
        let merged = merge(
            SOURCE,
            sections(&[
                ("general", "key1", "new"),
                ("general", "key3", "added"),
                ("other", "foo", "baz"),
                ("fresh", "a", "b"),
            ]),
        );
        assert_eq!(
            merged,
            "[general]\n# comment\nkey1 new\nkey2 keep\nkey3 added\n\n[other]\nfoo baz\n[fresh]\na b\n"
        );
    }

    #[test]
    fn empty_config_keeps_source() {
        assert_eq!(merge(SOURCE, Sections::new()), SOURCE);
    }

    #[tokio::test]
    async fn pristine_copy_is_made_once() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join(RUXIT_CONF_FILE);
        tokio::fs::create_dir_all(conf.parent().unwrap()).await.unwrap();
        tokio::fs::write(&conf, "[general]\nkey1 old\n").await.unwrap();

        let config = ProcessModuleConfig {
            revision: 1,
            properties: vec![ProcessModuleProperty {
                section: "general".to_string(),
                key: "key1".to_string(),
                value: "v1".to_string(),
            }],
        };
        update(dir.path(), &conf, &config).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&conf).await.unwrap(), "[general]\nkey1 v1\n");

        let mut next = config.clone();
        next.properties[0].value = "v2".to_string();
        update(dir.path(), &conf, &next).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&conf).await.unwrap(), "[general]\nkey1 v2\n");
        assert_eq!(
            tokio::fs::read_to_string(dir.path().join(RUXIT_CONF_SOURCE_FILE))
                .await
                .unwrap(),
            "[general]\nkey1 old\n"
        );
    }
}
