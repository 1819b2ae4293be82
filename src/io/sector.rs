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

//! Fixed-size sector access over a raw image.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::errors::FormatError;

/// Optical media sector size.  Other sizes exist in theory; we don't
/// support them.
pub const SECTOR_SIZE: usize = 2048;

/// Number of sectors needed to hold `bytes` bytes.
pub fn sectors_for(bytes: u64) -> u64 {
    (bytes + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64
}

/// Byte offset of a sector.
pub fn sector_offset(sector: u64) -> u64 {
    sector * SECTOR_SIZE as u64
}

/// Random-access sector reads.  Every call returns exactly what was asked
/// for or fails; a stream that ends early is a `FormatError`, not a short
/// result.
#[derive(Debug)]
pub struct SectorReader<R> {
    inner: R,
}

impl<R: Read + Seek> SectorReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_sector(&mut self, sector: u64) -> Result<Bytes> {
        self.read_sectors(sector, 1)
    }

    pub fn read_sectors(&mut self, sector: u64, count: u64) -> Result<Bytes> {
        let len = count
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|l| usize::try_from(l).ok())
            .ok_or_else(|| anyhow!(FormatError(format!("sector count {} too large", count))))?;
        self.read_at(sector, len)
    }

    /// Reads `len` bytes starting at `sector`.  The read covers whole
    /// sectors; the tail of the last one is dropped.
    pub fn read_bytes(&mut self, sector: u64, len: u64) -> Result<Bytes> {
        let mut buf = self.read_sectors(sector, sectors_for(len))?;
        buf.truncate(len as usize);
        Ok(buf)
    }

    fn read_at(&mut self, sector: u64, len: usize) -> Result<Bytes> {
        let offset = sector
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or_else(|| anyhow!(FormatError(format!("sector {} out of range", sector))))?;
        self.inner
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("seeking to sector {}", sector))?;
        let mut buf = vec![0; len];
        match self.inner.read_exact(&mut buf) {
            Ok(()) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(anyhow!(FormatError(format!(
                "image ends before sector {} + {} bytes; truncated image?",
                sector, len
            )))),
            Err(e) => Err(e).with_context(|| format!("reading sector {}", sector)),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}
