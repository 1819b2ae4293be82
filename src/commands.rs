// Copyright 2023 Red Hat, Inc.
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

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use crate::bootfiles::BootFiles;
use crate::cmdline::*;
use crate::detect::{Detector, Rules};
use crate::extract::{open_image, Extractor};
use crate::fsreader::DirEntry;

pub fn extract(config: ExtractConfig) -> Result<()> {
    let extractor = Extractor::new(&config.cache_dir, detector(&config.rules)?)
        .extract_tree(!config.no_tree);
    let files = extractor.extract(Path::new(&config.input))?;
    write_json(&files)
}

pub fn detect(config: DetectConfig) -> Result<()> {
    let detector = detector(&config.rules)?;
    let path = Path::new(&config.input);
    let mut image = open_image(path)?;
    let mut detection = detector.detect(image.as_mut())?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    detector.refine(&mut detection.files, &name, image.as_mut());
    write_json(&detection)
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct InspectOutput {
    format: &'static str,
    volume_id: String,
    records: BTreeMap<String, DirEntry>,
}

pub fn inspect(config: InspectConfig) -> Result<()> {
    let mut image = open_image(Path::new(&config.input))?;
    let records = image
        .walk()
        .context("while walking image filesystem")?
        .into_iter()
        .collect();
    write_json(&InspectOutput {
        format: image.format(),
        volume_id: image.volume_id(),
        records,
    })
}

pub fn cached(config: CachedConfig) -> Result<()> {
    let extractor = Extractor::new(&config.cache_dir, Detector::builtin()?);
    match config.name {
        Some(name) => {
            let files = extractor
                .cached(&name)?
                .with_context(|| format!("{} isn't in {}", name, config.cache_dir))?;
            write_json(&files)
        }
        None => {
            let mut all: BTreeMap<String, BootFiles> = BTreeMap::new();
            for name in extractor.cached_images()? {
                if let Some(files) = extractor.cached(&name)? {
                    all.insert(name, files);
                }
            }
            write_json(&all)
        }
    }
}

fn detector(rules: &[String]) -> Result<Detector> {
    Ok(Detector::new(Rules::load(rules)?))
}

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value).context("failed to serialize output")?;
    out.write_all(b"\n").context("failed to write newline")?;
    Ok(())
}
