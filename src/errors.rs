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

//! Error types that callers may want to branch on.  Everything else is
//! reported through `anyhow` with context.

use std::fmt;

/// The image is not readable as the requested container format: a
/// descriptor tag didn't match, a checksum was wrong, or a read came up
/// short of a record's declared length.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FormatError(pub String);

/// Requested path was not found.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NotFound(pub String);

/// No family in the probe table recognized the image.
#[derive(Debug, thiserror::Error)]
pub struct UnknownLayout {
    /// (family name, rejection reason) in the order the families were tried
    pub attempts: Vec<(String, String)>,
}

impl fmt::Display for UnknownLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no known boot layout found")?;
        if self.attempts.is_empty() {
            return write!(f, " (no families configured)");
        }
        write!(f, "; tried:")?;
        for (family, reason) in &self.attempts {
            write!(f, "\n  {}: {}", family, reason)?;
        }
        Ok(())
    }
}
