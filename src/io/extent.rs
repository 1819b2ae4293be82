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

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};

/// One run of file content.  `offset` is a byte offset into the image, or
/// `None` for an unrecorded run that reads as zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: Option<u64>,
    pub length: u64,
}

/// Reads file content scattered over several extents of an image, in
/// order.  The image ending inside an extent is an error rather than EOF.
pub struct ExtentReader<'a, R: Read + Seek> {
    source: &'a mut R,
    segments: VecDeque<Segment>,
    positioned: bool,
}

impl<'a, R: Read + Seek> ExtentReader<'a, R> {
    pub fn new(source: &'a mut R, segments: impl IntoIterator<Item = Segment>) -> Self {
        Self {
            source,
            segments: segments.into_iter().collect(),
            positioned: false,
        }
    }

    /// Total number of bytes this reader will produce.
    pub fn remaining(&self) -> u64 {
        self.segments.iter().map(|s| s.length).sum()
    }
}

impl<'a, R: Read + Seek> Read for ExtentReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let segment = match self.segments.front_mut() {
                Some(s) => s,
                None => return Ok(0),
            };
            if segment.length == 0 {
                self.segments.pop_front();
                self.positioned = false;
                continue;
            }
            let allowed = segment.length.min(buf.len() as u64) as usize;
            let count = match segment.offset {
                None => {
                    buf[..allowed].fill(0);
                    allowed
                }
                Some(offset) => {
                    if !self.positioned {
                        self.source.seek(SeekFrom::Start(offset))?;
                        self.positioned = true;
                    }
                    let count = self.source.read(&mut buf[..allowed])?;
                    if count == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "image ends inside extent at offset {} ({} bytes missing)",
                                offset, segment.length
                            ),
                        ));
                    }
                    segment.offset = Some(offset + count as u64);
                    count
                }
            };
            segment.length -= count as u64;
            return Ok(count);
        }
    }
}
