// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Integration discovery.
//!
//! Looks at the processes running on the host, matches their command lines against a catalog
//! of known integrations, and reports which integrations the agent is already running or
//! failing to load according to an agent status snapshot.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod matcher;
pub mod process;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

pub use matcher::{Integration, Matcher};
pub use process::{ProcFsSource, ProcessSource, StaticSource};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("couldn't build process matcher: {0}")]
    Matcher(#[source] regex::Error),

    #[error("couldn't retrieve process list: {0}")]
    ProcessList(#[source] std::io::Error),

    #[error("couldn't decode agent status: {0}")]
    Status(String),
}

/// A running process that matches an integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationProcess {
    /// The command line that matched the integration
    pub cmd: String,
    /// The integration display name
    pub display_name: String,
    /// The integration name
    pub name: String,
}

/// Discovery results, keyed by integration name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveredIntegrations {
    pub discovered: HashMap<String, Vec<IntegrationProcess>>,
    /// Checks the agent is currently running
    pub running: HashSet<String>,
    /// Checks the agent failed to load
    pub failing: HashSet<String>,
}

/// Extracts the running checks (`runnerStats.Checks`) and the checks that failed to load
/// (`checkSchedulerStats.LoaderErrors`) from an agent status snapshot.
///
/// A missing or null section yields an empty set.
pub fn integration_status(
    status: &Value,
) -> Result<(HashSet<String>, HashSet<String>), DiscoveryError> {
    let Some(status) = status.as_object() else {
        return Err(DiscoveryError::Status(
            "status is not a JSON object".to_string(),
        ));
    };

    let keys = |section: &str, field: &str| -> Result<HashSet<String>, DiscoveryError> {
        match status.get(section).and_then(|s| s.get(field)) {
            None | Some(Value::Null) => Ok(HashSet::new()),
            Some(Value::Object(map)) => Ok(map.keys().cloned().collect()),
            Some(_) => Err(DiscoveryError::Status(format!(
                "{section}.{field} is not a JSON object"
            ))),
        }
    };

    let running = keys("runnerStats", "Checks")?;
    let failing = keys("checkSchedulerStats", "LoaderErrors")?;
    Ok((running, failing))
}

/// Matches every distinct process command line against `matcher` and groups the hits by
/// integration name, alongside the running/failing checks reported by `status`.
pub fn discover_integrations(
    matcher: &Matcher,
    processes: &dyn ProcessSource,
    status: &Value,
) -> Result<DiscoveredIntegrations, DiscoveryError> {
    let cmdlines: BTreeSet<String> = processes
        .command_lines()
        .map_err(DiscoveryError::ProcessList)?
        .into_iter()
        .collect();

    let (running, failing) = integration_status(status)?;

    let mut discovered: HashMap<String, Vec<IntegrationProcess>> = HashMap::new();
    for cmd in cmdlines {
        let Some(integration) = matcher.match_cmdline(&cmd) else {
            continue;
        };
        discovered
            .entry(integration.name.clone())
            .or_default()
            .push(IntegrationProcess {
                cmd,
                display_name: integration.display_name.clone(),
                name: integration.name.clone(),
            });
    }

    debug!(
        "discovered {} integrations, {} running, {} failing",
        discovered.len(),
        running.len(),
        failing.len()
    );

    Ok(DiscoveredIntegrations {
        discovered,
        running,
        failing,
    })
}
