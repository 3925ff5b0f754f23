//! Instances and the cluster inventory.
//!
//! The inventory file maps cluster names to ordered lists of instances. An entry is
//! either a bare address or a mapping with the full record.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use colored::{Color, ColoredString, Colorize};
use serde::de::{self, value::MapAccessDeserializer, MapAccess, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use void::Void;

use crate::error::{NimbusError, Result};
use crate::paths::resolve_under;

/// Target that selects every instance in the inventory.
pub const ALL: &str = "all";

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_SSH_KEY: &str = "nimbus.key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Name used to prefix output and to select the instance.
    pub name: String,
    /// Hostname or IP address to connect to.
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default = "default_user")]
    pub user: String,
    /// Private key, relative to the config directory unless absolute.
    #[serde(default = "default_ssh_key")]
    pub ssh_key: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Raw resource record returned by the cloud provider, if provisioned there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<serde_json::Value>,
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_ssh_key() -> String {
    DEFAULT_SSH_KEY.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Instance {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            user: default_user(),
            ssh_key: default_ssh_key(),
            port: DEFAULT_PORT,
            provider: None,
        }
    }

    /// For pretty-printing the instance name.
    /// Surrounds with brackets and colors it with its palette slot.
    pub fn prettify(&self, color: Color) -> ColoredString {
        self.to_string().color(color)
    }

    /// Absolute path of the private key used for this instance.
    pub fn key_path(&self, config_dir: &Path) -> PathBuf {
        resolve_under(config_dir, &self.ssh_key)
    }

    /// Provider-side numeric id, if the instance was provisioned through a provider.
    pub fn provider_id(&self) -> Option<u64> {
        self.provider.as_ref()?.get("id")?.as_u64()
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.name)
    }
}

impl FromStr for Instance {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s, s))
    }
}

/// One inventory entry: a bare address (also used as the name) or a full mapping.
struct InstanceEntry(Instance);

impl<'de> Deserialize<'de> for InstanceEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(EntryVisitor).map(InstanceEntry)
    }
}

struct EntryVisitor;

impl<'de> Visitor<'de> for EntryVisitor {
    type Value = Instance;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an address or an instance mapping")
    }

    fn visit_str<E>(self, value: &str) -> Result<Instance, E>
    where
        E: de::Error,
    {
        let address = value.trim();
        if address.is_empty() {
            return Err(E::invalid_value(Unexpected::Str(value), &self));
        }
        match address.parse::<Instance>() {
            Ok(instance) => Ok(instance),
            Err(never) => void::unreachable(never),
        }
    }

    fn visit_map<M>(self, map: M) -> Result<Instance, M::Error>
    where
        M: MapAccess<'de>,
    {
        Instance::deserialize(MapAccessDeserializer::new(map))
    }
}

/// Maps a name, cluster name, or `all` to an ordered set of instances.
pub trait InstanceResolver {
    /// Never returns an empty set; no match is `NimbusError::NotFound`.
    fn resolve(&self, target: &str) -> Result<Vec<Instance>>;
}

/// Clusters of instances persisted in `clusters.yaml`.
#[derive(Debug)]
pub struct Inventory {
    path: PathBuf,
    clusters: BTreeMap<String, Vec<Instance>>,
}

impl Inventory {
    /// Loads the inventory file. A missing file is an empty inventory.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let clusters = if path.exists() {
            let file = File::open(&path)?;
            let raw: Option<BTreeMap<String, Vec<InstanceEntry>>> = serde_yaml::from_reader(file)?;
            raw.unwrap_or_default()
                .into_iter()
                .map(|(cluster, entries)| {
                    (cluster, entries.into_iter().map(|entry| entry.0).collect())
                })
                .collect()
        } else {
            log::debug!("{} does not exist, starting empty", path.display());
            BTreeMap::new()
        };
        Ok(Self { path, clusters })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        serde_yaml::to_writer(File::create(&self.path)?, &self.clusters)?;
        log::debug!("Saved inventory to {}", self.path.display());
        Ok(())
    }

    pub fn clusters(&self) -> &BTreeMap<String, Vec<Instance>> {
        &self.clusters
    }

    pub fn find(&self, name: &str) -> Option<&Instance> {
        self.clusters.values().flatten().find(|i| i.name == name)
    }

    /// Adds an instance to a cluster, replacing any instance with the same name.
    pub fn add_instance(&mut self, cluster: &str, instance: Instance) {
        self.remove_instance(&instance.name).ok();
        self.clusters
            .entry(cluster.to_string())
            .or_default()
            .push(instance);
    }

    pub fn update_instance<F>(&mut self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut Instance),
    {
        let instance = self
            .clusters
            .values_mut()
            .flatten()
            .find(|i| i.name == name)
            .ok_or_else(|| NimbusError::NotFound(name.to_string()))?;
        update(instance);
        Ok(())
    }

    pub fn remove_instance(&mut self, name: &str) -> Result<Instance> {
        for instances in self.clusters.values_mut() {
            if let Some(index) = instances.iter().position(|i| i.name == name) {
                return Ok(instances.remove(index));
            }
        }
        Err(NimbusError::NotFound(name.to_string()))
    }
}

impl InstanceResolver for Inventory {
    fn resolve(&self, target: &str) -> Result<Vec<Instance>> {
        let instances: Vec<Instance> = if target == ALL {
            self.clusters.values().flatten().cloned().collect()
        } else if let Some(cluster) = self.clusters.get(target) {
            cluster.clone()
        } else {
            self.find(target).cloned().into_iter().collect()
        };

        if instances.is_empty() {
            return Err(NimbusError::NotFound(target.to_string()));
        }
        Ok(instances)
    }
}
