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

//! Boot file detection and extraction for OS installation images.
//!
//! An image is opened as UDF or ISO 9660, probed against an ordered table
//! of distribution layouts, and the files needed to network-boot it are
//! copied into a per-image cache directory.

pub mod bootfiles;
pub mod cmdline;
pub mod commands;
pub mod detect;
pub mod errors;
pub mod extract;
pub mod fsreader;
pub mod io;
pub mod iso9660;
pub mod udf;
