use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Per-image entry of a cloud profile's configuration blob.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Inventory path of the source template. A trailing `@` selects the
    /// generation family: the highest-numbered frozen sibling is picked at
    /// clone time instead of a fixed VM.
    pub template: String,

    /// Folder the instances are created in; defaults to the template's
    /// parent folder.
    #[serde(default)]
    pub instance_folder: Option<String>,

    #[serde(default)]
    pub resource_pool: Option<String>,

    #[serde(default)]
    pub datastore: Option<String>,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Agent pool assignment, by name or numeric id.
    #[serde(default)]
    pub agent_pool: Option<AgentPoolRef>,

    /// Networks the clone's ethernet cards are rewired to, in device order.
    /// A single string is accepted in place of a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub network: Vec<String>,

    /// Graceful guest shutdown deadline, seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl ImageConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AgentPoolRef {
    Id(i64),
    Name(String),
}

fn default_max_instances() -> usize {
    usize::MAX
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Knobs of the clone-from-self workflow. The cleanup switch makes the
/// destroy-failure policy explicit instead of implied.
#[derive(Debug, Clone)]
pub struct CloneTuning {
    /// Fixed delay before the first freeze-state poll.
    pub freeze_initial_delay: Duration,
    /// Additional bounded polling window after the initial delay.
    pub freeze_poll_window: Duration,
    pub freeze_poll_interval: Duration,
    /// How many newest frozen generations survive cleanup.
    pub generation_retention: usize,
    /// Whether a failed destroy of a superseded generation fails the whole
    /// clone job (default) or is only reported.
    pub cleanup_failure_fatal: bool,
}

impl Default for CloneTuning {
    fn default() -> Self {
        Self {
            freeze_initial_delay: Duration::from_secs(20),
            freeze_poll_window: Duration::from_secs(80),
            freeze_poll_interval: Duration::from_secs(1),
            generation_retention: 2,
            cleanup_failure_fatal: true,
        }
    }
}
