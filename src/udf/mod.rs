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

//! Read-only UDF support, enough to list directories and read files from
//! installation media.  Windows images are UDF bridge discs whose ISO 9660
//! side only holds a readme, so this is tried before ISO 9660.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use std::io::{Cursor, ErrorKind, Read, Seek};

use crate::errors::FormatError;
use crate::fsreader::{DirEntry, Volume};
use crate::io::{sector_offset, sectors_for, ExtentReader, Segment, SectorReader, SECTOR_SIZE};

pub mod descriptor;
pub mod extent;
#[cfg(test)]
pub(crate) mod fixture;

use self::descriptor::*;
use self::extent::{ExtentKind, ExtentLong};

/// Location of the Anchor Volume Descriptor Pointer.
const ANCHOR_SECTOR: u64 = 256;

/// Limit on Volume Descriptor Pointer hops while walking a sequence.
const MAX_SEQUENCE_HOPS: usize = 8;

/// Directories larger than this are assumed corrupt.
const MAX_DIRECTORY_SIZE: u64 = 16 * 1024 * 1024;

pub struct UdfFs<R: Read + Seek> {
    reader: SectorReader<R>,
    partition: Partition,
    volume_id: String,
    root: File,
}

/// The partition all logical block numbers are relative to.
#[derive(Debug, Clone, Copy)]
struct Partition {
    start: u64,
    length: u64,
}

impl Partition {
    /// Absolute sector of a logical block.
    fn sector(&self, block: u64) -> Result<u64> {
        if block >= self.length {
            bail!(FormatError(format!(
                "block {} is outside the {}-block partition",
                block, self.length
            )));
        }
        Ok(self.start + block)
    }
}

/// A directory entry together with its file entry.
#[derive(Debug, Clone)]
pub struct File {
    pub name: String,
    pub icb: ExtentLong,
    pub entry: FileEntry,
}

impl File {
    pub fn is_dir(&self) -> bool {
        self.entry.is_dir()
    }

    pub fn size(&self) -> u64 {
        self.entry.information_length
    }
}

/// The descriptors of a volume descriptor sequence that we care about.
#[derive(Default)]
struct VolumeSet {
    primary: Option<PrimaryVolumeDescriptor>,
    partition: Option<PartitionDescriptor>,
    logical: Option<LogicalVolumeDescriptor>,
}

impl<R: Read + Seek> UdfFs<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = SectorReader::new(reader);
        let anchor = match reader.read_sector(ANCHOR_SECTOR).and_then(Descriptor::parse) {
            Ok(Descriptor::Anchor(a)) => a,
            Ok(d) => bail!(FormatError(format!(
                "not a UDF volume: found {} descriptor at sector {}",
                d.kind(),
                ANCHOR_SECTOR
            ))),
            Err(e) => bail!(FormatError(format!("not a UDF volume: {:#}", e))),
        };

        let set = match read_sequence(&mut reader, anchor.main) {
            Ok(set) => set,
            Err(e) => {
                warn!(
                    "main volume descriptor sequence unusable, trying reserve: {:#}",
                    e
                );
                read_sequence(&mut reader, anchor.reserve)
                    .context("reading reserve volume descriptor sequence")?
            }
        };
        // read_sequence checked these
        let (partition, logical) = match (set.partition, set.logical) {
            (Some(p), Some(l)) => (p, l),
            _ => bail!(FormatError("incomplete volume descriptor sequence".into())),
        };
        if logical.block_size as usize != SECTOR_SIZE {
            bail!(FormatError(format!(
                "unsupported logical block size {}",
                logical.block_size
            )));
        }
        let volume_id = if logical.volume_id.is_empty() {
            set.primary.map(|p| p.volume_id).unwrap_or_default()
        } else {
            logical.volume_id
        };
        debug!(
            "UDF volume {:?}: partition {} at sector {}, {} blocks",
            volume_id, partition.number, partition.starting_location, partition.length
        );

        let partition = Partition {
            start: partition.starting_location as u64,
            length: partition.length as u64,
        };
        let file_set = match read_block(&mut reader, &partition, &logical.file_set)
            .context("reading file set")?
        {
            Descriptor::FileSet(fsd) => fsd,
            d => bail!(FormatError(format!(
                "expected file set descriptor, found {}",
                d.kind()
            ))),
        };
        let entry = read_entry(&mut reader, &partition, &file_set.root)
            .context("reading root directory")?;
        if !entry.is_dir() {
            bail!(FormatError("root ICB is not a directory".into()));
        }
        Ok(Self {
            reader,
            partition,
            volume_id,
            root: File {
                name: String::new(),
                icb: file_set.root,
                entry,
            },
        })
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn partition_start(&self) -> u64 {
        self.partition.start
    }

    pub fn root_dir(&self) -> &File {
        &self.root
    }

    /// Lists a directory, skipping the parent link and deleted entries.
    pub fn read_dir(&mut self, dir: &File) -> Result<Vec<File>> {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.name);
        }
        let data = self.read_directory_data(dir)?;
        let mut ret = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let fid = FileIdentifier::parse(&data[offset..]).with_context(|| {
                format!(
                    "parsing directory record at offset {} of {:?}",
                    offset, dir.name
                )
            })?;
            offset += fid.record_length;
            if fid.is_parent() || fid.is_deleted() || fid.name.is_empty() {
                continue;
            }
            let entry = read_entry(&mut self.reader, &self.partition, &fid.icb)
                .with_context(|| format!("reading file entry for {:?}", fid.name))?;
            ret.push(File {
                name: fid.name,
                icb: fid.icb,
                entry,
            });
        }
        Ok(ret)
    }

    /// Returns a reader yielding exactly the file's information length.
    pub fn read_file(&mut self, file: &File) -> Result<Box<dyn Read + '_>> {
        let length = file.size();
        let segments = match &file.entry.allocation {
            Allocation::Embedded(data) => {
                if length > data.len() as u64 {
                    bail!(FormatError(format!(
                        "{:?} claims {} bytes but embeds {}",
                        file.name,
                        length,
                        data.len()
                    )));
                }
                return Ok(Box::new(Cursor::new(data.slice(..length as usize))));
            }
            Allocation::Short(ads) => self.segments(
                ads.iter().map(|ad| (ad.location, ad.byte_length(), ad.kind())),
                length,
            )?,
            Allocation::Long(ads) => self.segments(
                ads.iter().map(|ad| (ad.block(), ad.byte_length(), ad.kind())),
                length,
            )?,
        };
        Ok(Box::new(ExtentReader::new(self.reader.get_mut(), segments)))
    }

    /// Maps allocation descriptors to image byte ranges covering the
    /// first `length` bytes of a file.
    fn segments(
        &self,
        ads: impl Iterator<Item = (u32, u32, ExtentKind)>,
        length: u64,
    ) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut remaining = length;
        for (block, len, kind) in ads {
            if remaining == 0 {
                break;
            }
            let len = (len as u64).min(remaining);
            let offset = match kind {
                ExtentKind::Recorded => {
                    // the whole extent has to be inside the partition
                    self.partition
                        .sector(block as u64 + sectors_for(len).saturating_sub(1))?;
                    Some(sector_offset(self.partition.sector(block as u64)?))
                }
                _ => None,
            };
            segments.push(Segment {
                offset,
                length: len,
            });
            remaining -= len;
        }
        if remaining > 0 {
            bail!(FormatError(format!(
                "allocation descriptors cover {} of {} bytes",
                length - remaining,
                length
            )));
        }
        Ok(segments)
    }

    fn read_directory_data(&mut self, dir: &File) -> Result<Vec<u8>> {
        let length = dir.size();
        if length > MAX_DIRECTORY_SIZE {
            bail!(FormatError(format!(
                "directory {:?} is implausibly large ({} bytes)",
                dir.name, length
            )));
        }
        let mut data = Vec::with_capacity(length as usize);
        match self.read_file(dir)?.read_to_end(&mut data) {
            Ok(_) => Ok(data),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                Err(anyhow!(FormatError(e.to_string())))
                    .with_context(|| format!("reading directory {:?}", dir.name))
            }
            Err(e) => Err(e).with_context(|| format!("reading directory {:?}", dir.name)),
        }
    }
}

fn read_entry<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    partition: &Partition,
    icb: &ExtentLong,
) -> Result<FileEntry> {
    match read_block(reader, partition, icb)? {
        Descriptor::FileEntry(entry) => Ok(entry),
        d => bail!(FormatError(format!(
            "expected file entry at block {}, found {}",
            icb.block(),
            d.kind()
        ))),
    }
}

fn read_block<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    partition: &Partition,
    ad: &ExtentLong,
) -> Result<Descriptor> {
    let sector = partition.sector(ad.block() as u64)?;
    Descriptor::parse(reader.read_sector(sector)?)
        .with_context(|| format!("parsing descriptor at sector {}", sector))
}

/// Walks a volume descriptor sequence starting at `extent`, following
/// pointers, until a terminating descriptor or the end of the extent.
fn read_sequence<R: Read + Seek>(
    reader: &mut SectorReader<R>,
    extent: extent::Extent,
) -> Result<VolumeSet> {
    let mut set = VolumeSet::default();
    let mut start = extent.location as u64;
    let mut count = sectors_for(extent.length as u64);
    let mut hops = 0;
    loop {
        let mut next = None;
        for sector in start..start + count {
            let descriptor = Descriptor::parse(reader.read_sector(sector)?)
                .with_context(|| format!("parsing volume descriptor at sector {}", sector))?;
            match descriptor {
                Descriptor::PrimaryVolume(d) => {
                    set.primary.get_or_insert(d);
                }
                Descriptor::Partition(d) => {
                    set.partition.get_or_insert(d);
                }
                Descriptor::LogicalVolume(d) => {
                    set.logical.get_or_insert(d);
                }
                Descriptor::VolumePointer(d) => {
                    next = Some(d.next);
                    break;
                }
                Descriptor::Terminating => break,
                Descriptor::ImplementationUse | Descriptor::UnallocatedSpace => (),
                d => bail!(FormatError(format!(
                    "unexpected {} descriptor in volume descriptor sequence at sector {}",
                    d.kind(),
                    sector
                ))),
            }
        }
        match next {
            Some(e) => {
                hops += 1;
                if hops > MAX_SEQUENCE_HOPS {
                    bail!(FormatError(format!(
                        "more than {} volume descriptor pointers; loop?",
                        MAX_SEQUENCE_HOPS
                    )));
                }
                start = e.location as u64;
                count = sectors_for(e.length as u64);
            }
            None => break,
        }
    }
    if set.partition.is_none() {
        bail!(FormatError("no partition descriptor".into()));
    }
    if set.logical.is_none() {
        bail!(FormatError("no logical volume descriptor".into()));
    }
    Ok(set)
}

impl<R: Read + Seek> Volume for UdfFs<R> {
    type Node = File;

    const FORMAT: &'static str = "udf";

    fn label(&self) -> &str {
        &self.volume_id
    }

    fn root(&mut self) -> Result<File> {
        Ok(self.root.clone())
    }

    fn entry(&self, node: &File) -> DirEntry {
        DirEntry {
            name: node.name.clone(),
            size: node.size(),
            is_dir: node.is_dir(),
            modified: Some(node.entry.modified),
        }
    }

    fn children(&mut self, dir: &File) -> Result<Vec<File>> {
        self.read_dir(dir)
    }

    fn open(&mut self, file: &File) -> Result<Box<dyn Read + '_>> {
        self.read_file(file)
    }

    fn node_key(&self, node: &File) -> Option<u64> {
        Some(node.icb.block() as u64)
    }
}
