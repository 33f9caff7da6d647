// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::job::duration_millis;

/// Configuration of the client core.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub group_sync: GroupSyncSettings,
}

/// Configuration for the database.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct DatabaseSettings {
    /// Path of the sqlite database file
    ///
    /// If this isn't present, jobs are kept in an in-memory database and lost on restart.
    pub path: Option<PathBuf>,
}

/// Timing of group sync jobs. All durations are given in milliseconds.
#[derive(Deserialize, Clone, Debug)]
pub struct GroupSyncSettings {
    /// Minimum spacing between two syncs of the same group
    #[serde(with = "duration_millis", default = "default_15s")]
    pub min_interval: Duration,
    /// Delay of a newly requested sync, so that the change causing it can settle
    #[serde(with = "duration_millis", default = "default_1s")]
    pub lead_time: Duration,
    /// Number of runs of a sync job before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "duration_millis", default = "default_15s")]
    pub retry_delay: Duration,
    /// Upper bound of a single sync run
    #[serde(with = "duration_millis", default = "default_20s")]
    pub job_timeout: Duration,
}

impl Default for GroupSyncSettings {
    fn default() -> Self {
        Self {
            min_interval: default_15s(),
            lead_time: default_1s(),
            max_attempts: default_max_attempts(),
            retry_delay: default_15s(),
            job_timeout: default_20s(),
        }
    }
}

fn default_1s() -> Duration {
    Duration::from_secs(1)
}

fn default_15s() -> Duration {
    Duration::from_secs(15)
}

fn default_20s() -> Duration {
    Duration::from_secs(20)
}

fn default_max_attempts() -> u32 {
    2
}

/// Loads the settings from `base.yaml` and the optional `local.yaml` in the directory `prefix`.
///
/// Values can be overridden with environment variables such as
/// `SWARMSYNC_GROUP_SYNC__MIN_INTERVAL=5000`.
pub fn get_configuration(prefix: &str) -> Result<Settings, ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|error| ConfigError::Foreign(error.into()))?
        .join(prefix);

    Config::builder()
        .add_source(File::from(base_path.join("base.yaml")).required(false))
        .add_source(File::from(base_path.join("local.yaml")).required(false))
        .add_source(environment())
        .build()?
        .try_deserialize()
}

/// Loads the settings from YAML strings, e.g. in tests.
pub fn get_configuration_from_str(base: &str, local: &str) -> Result<Settings, ConfigError> {
    Config::builder()
        .add_source(File::from_str(base, FileFormat::Yaml))
        .add_source(File::from_str(local, FileFormat::Yaml))
        .add_source(environment())
        .build()?
        .try_deserialize()
}

fn environment() -> Environment {
    Environment::with_prefix("SWARMSYNC")
        .prefix_separator("_")
        .separator("__")
}
