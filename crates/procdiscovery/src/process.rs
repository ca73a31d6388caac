// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sources of running process command lines.

use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, trace};

const PROC_PATH: &str = "/proc";

/// Lists the command lines of the processes running on the host.
pub trait ProcessSource {
    fn command_lines(&self) -> io::Result<Vec<String>>;
}

/// Reads command lines from a procfs tree (`<root>/<pid>/cmdline`).
///
/// Arguments are NUL-separated in procfs and are joined with spaces. Processes without a
/// command line (kernel threads, zombies) or that exit while being read are skipped.
#[derive(Debug, Clone)]
pub struct ProcFsSource {
    root: PathBuf,
}

impl ProcFsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcFsSource {
    fn default() -> Self {
        Self::new(PROC_PATH)
    }
}

impl ProcessSource for ProcFsSource {
    fn command_lines(&self) -> io::Result<Vec<String>> {
        let entries = fs::read_dir(&self.root)?;

        let pids = entries.filter_map(|entry| {
            let entry = entry.ok()?;
            if !entry.file_type().ok()?.is_dir() {
                return None;
            }
            // skip non-PID entries like "self" or "net"
            entry.file_name().to_str()?.parse::<u32>().ok()
        });

        let mut cmdlines = Vec::new();
        for pid in pids {
            let path = self.root.join(pid.to_string()).join("cmdline");
            match fs::read(&path) {
                Ok(raw) => {
                    if let Some(cmdline) = join_cmdline(&raw) {
                        cmdlines.push(cmdline);
                    }
                }
                Err(e) => trace!("could not read {}: {}", path.display(), e),
            }
        }

        debug!(
            "read {} process command lines from {}",
            cmdlines.len(),
            self.root.display()
        );
        Ok(cmdlines)
    }
}

fn join_cmdline(raw: &[u8]) -> Option<String> {
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    if args.is_empty() {
        None
    } else {
        Some(args.join(" "))
    }
}

/// Fixed list of command lines.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(pub Vec<String>);

impl ProcessSource for StaticSource {
    fn command_lines(&self) -> io::Result<Vec<String>> {
        Ok(self.0.clone())
    }
}
