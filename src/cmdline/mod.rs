// Copyright 2019 CoreOS, Inc.
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

use clap::Parser;

// Args are listed in --help in the order declared in these structs/enums.
// Please keep the entire help text to 80 columns.

/// Find and extract the boot files of OS installation images
#[derive(Debug, Parser)]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
#[command(disable_help_subcommand = true)]
#[command(help_expected = true)]
pub enum Cmd {
    /// Copy an image's boot files into the cache
    Extract(ExtractConfig),
    /// Show how an image would be booted, without copying anything
    Detect(DetectConfig),
    /// List the filesystem of an image
    Inspect(InspectConfig),
    /// Show boot files already in the cache
    Cached(CachedConfig),
}

#[derive(Debug, Parser)]
pub struct ExtractConfig {
    /// Cache directory
    #[arg(short = 'C', long, value_name = "PATH", default_value = ".")]
    pub cache_dir: String,
    /// Layout rules file, tried before the built-in rules
    #[arg(short, long = "rules", value_name = "PATH")]
    pub rules: Vec<String>,
    /// Don't mirror the image tree for non-Windows images
    #[arg(long)]
    pub no_tree: bool,
    /// Image to extract
    #[arg(value_name = "ISO")]
    pub input: String,
}

#[derive(Debug, Parser)]
pub struct DetectConfig {
    /// Layout rules file, tried before the built-in rules
    #[arg(short, long = "rules", value_name = "PATH")]
    pub rules: Vec<String>,
    /// Image to examine
    #[arg(value_name = "ISO")]
    pub input: String,
}

#[derive(Debug, Parser)]
pub struct InspectConfig {
    /// Image to list
    #[arg(value_name = "ISO")]
    pub input: String,
}

#[derive(Debug, Parser)]
pub struct CachedConfig {
    /// Cache directory
    #[arg(short = 'C', long, value_name = "PATH", default_value = ".")]
    pub cache_dir: String,
    /// Cache entry; all entries if omitted
    #[arg(value_name = "NAME")]
    pub name: Option<String>,
}
