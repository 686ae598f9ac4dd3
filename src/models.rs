use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap as Map;
use std::fmt;

/// Reserved pseudo-container name for local-machine execution.
pub const HOST_CONTAINER: &str = "host";

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerName(pub String);

impl ContainerName {
    pub fn new<S: Into<String>>(name: S) -> ContainerName {
        ContainerName(name.into())
    }

    pub fn is_host(&self) -> bool {
        self.0 == HOST_CONTAINER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The resolved first YAML document of a unit file: container name to spec.
pub type Configurations = Map<ContainerName, ContainerSpec>;

/// One named container's declarative configuration.
///
/// Fields the orchestrator does not interpret stay in the pass-through
/// buckets and travel to the runtime untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default, skip_serializing_if = "CreationSpec::is_empty")]
    pub creation: CreationSpec,

    #[serde(default, skip_serializing_if = "StartupSpec::is_empty")]
    pub startup: StartupSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    #[serde(flatten)]
    pub extra: Map<String, serde_yaml::Value>,
}

impl ContainerSpec {
    /// The build spec, if one with any content is present.  An empty
    /// `build: {}` block counts as absent.
    pub fn build_spec(&self) -> Option<&BuildSpec> {
        self.build.as_ref().filter(|build| !build.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Pull tag for `image`; defaults to `latest` when pulling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Ports exposed at creation time.  The spec normalization unions the
    /// startup port-binding keys into this list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, serde_yaml::Value>,
}

impl CreationSpec {
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && self.tag.is_none()
            && self.ports.is_empty()
            && self.command.is_none()
            && self.extra.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StartupSpec {
    /// Host path to container mount point.  Sources may contain
    /// `${CONFIG_DIR}` which resolves to the container's build path.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub binds: Map<String, BindTarget>,

    /// Container port (e.g. `80/tcp`) to host binding.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub port_bindings: Map<String, serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, serde_yaml::Value>,
}

impl StartupSpec {
    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
            && self.port_bindings.is_empty()
            && self.volumes_from.is_empty()
            && self.extra.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BindTarget {
    pub bind: String,

    #[serde(default)]
    pub ro: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context directory, relative to the configuration directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Image tag.  Only tagged builds are torn down by `purge`; untagged
    /// build entries refer to pulled images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rm: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, serde_yaml::Value>,
}

impl BuildSpec {
    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.tag.is_none() && self.rm.is_none() && self.extra.is_empty()
    }

    pub fn is_tagged(&self) -> bool {
        self.tag.as_ref().map_or(false, |tag| !tag.is_empty())
    }
}

fn default_timeout() -> u32 {
    10
}

fn default_source() -> String {
    "/".to_string()
}

fn default_archive_name() -> String {
    "backup".to_string()
}

fn default_directory() -> String {
    ".".to_string()
}

/// A single container operation, tagged by its `command` field in YAML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Order {
    Build,
    Create,
    Start {
        #[serde(default)]
        restart: bool,
        #[serde(default = "default_timeout")]
        timeout: u32,
    },
    Stop {
        #[serde(default = "default_timeout")]
        timeout: u32,
    },
    Remove {
        #[serde(default)]
        v: bool,
        #[serde(default = "default_timeout")]
        timeout: u32,
    },
    RemoveImage {
        #[serde(default)]
        force: bool,
        #[serde(default)]
        noprune: bool,
    },
    Backup {
        #[serde(default = "default_directory")]
        backup_dir: String,
        #[serde(default = "default_source")]
        source: String,
        #[serde(default = "default_archive_name")]
        backup_name: String,
        #[serde(default)]
        overwrite: bool,
    },
    Restore {
        #[serde(default = "default_directory")]
        restore_dir: String,
        #[serde(default = "default_archive_name")]
        restore_name: String,
    },
    Execute {
        run: Vec<String>,
        #[serde(default)]
        shell: bool,
        #[serde(default)]
        binds: Map<String, BindTarget>,
    },
}

fn is_zero(wait: &u64) -> bool {
    *wait == 0
}

/// An order plus the cross-command pacing field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    #[serde(flatten)]
    pub order: Order,

    /// Seconds to sleep after the step completes, to let a just-started
    /// daemon become reachable before the next dependent step.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub wait: u64,
}

impl From<Order> for OrderSpec {
    fn from(order: Order) -> OrderSpec {
        OrderSpec { order, wait: 0 }
    }
}

/// One entry of an order list.  The YAML shape is a single-entry map from
/// container name to order spec; order lists are sequences of these.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderEntry {
    pub name: ContainerName,
    pub spec: OrderSpec,
}

impl OrderEntry {
    pub fn new<S: Into<String>>(name: S, order: Order) -> OrderEntry {
        OrderEntry {
            name: ContainerName::new(name),
            spec: order.into(),
        }
    }
}

impl Serialize for OrderEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.name, &self.spec)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<OrderEntry, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = OrderEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a single-entry map of container name to order")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<OrderEntry, A::Error> {
                let (name, spec): (ContainerName, OrderSpec) = map
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("order entry must name a container"))?;
                if map.next_key::<ContainerName>()?.is_some() {
                    return Err(de::Error::custom(
                        "order entry must contain exactly one command",
                    ));
                }
                Ok(OrderEntry { name, spec })
            }
        }

        deserializer.deserialize_map(EntryVisitor)
    }
}

/// Summary record for an image known to the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Summary record for a container known to the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: ContainerName,
    pub running: bool,
}

/// Everything the runtime needs to create a container.
///
/// Modern runtimes take host configuration (binds, port bindings, borrowed
/// volumes) at creation time, so the lifecycle folds its startup spec in
/// here rather than passing it to `start`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateRequest {
    pub name: Option<ContainerName>,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub ports: Vec<String>,
    pub binds: Map<String, BindTarget>,
    pub port_bindings: Map<String, serde_yaml::Value>,
    pub volumes_from: Vec<String>,
    pub extra: Map<String, serde_yaml::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_entry_parses_single_entry_map() {
        let yaml = "webserver:\n  command: start\n  restart: true\n  timeout: 0\n  wait: 2\n";
        let entry: OrderEntry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(entry.name, ContainerName::new("webserver"));
        assert_eq!(
            entry.spec.order,
            Order::Start {
                restart: true,
                timeout: 0
            }
        );
        assert_eq!(entry.spec.wait, 2);
    }

    #[test]
    fn order_entry_defaults() {
        let entry: OrderEntry = serde_yaml::from_str("db:\n  command: stop\n").unwrap();
        assert_eq!(entry.spec.order, Order::Stop { timeout: 10 });
        assert_eq!(entry.spec.wait, 0);
    }

    #[test]
    fn order_entry_rejects_two_commands() {
        let yaml = "a:\n  command: stop\nb:\n  command: stop\n";
        assert!(serde_yaml::from_str::<OrderEntry>(yaml).is_err());
    }

    #[test]
    fn order_entry_rejects_unknown_command() {
        let yaml = "a:\n  command: levitate\n";
        assert!(serde_yaml::from_str::<OrderEntry>(yaml).is_err());
    }

    #[test]
    fn order_entry_serializes_as_single_entry_map() {
        let entry = OrderEntry::new("cache", Order::Remove { v: false, timeout: 10 });
        let yaml = serde_yaml::to_string(&entry).unwrap();
        let back: OrderEntry = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn container_spec_keeps_unrecognized_fields() {
        let yaml = "
creation:
  image: busybox:latest
  hostname: box
startup:
  binds:
    /srv/data:
      bind: /data
daemon:
  enabled: true
";
        let spec: ContainerSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.creation.image.as_deref(), Some("busybox:latest"));
        assert!(spec.creation.extra.contains_key("hostname"));
        assert!(spec.extra.contains_key("daemon"));
        assert_eq!(spec.startup.binds["/srv/data"].bind, "/data");
        assert!(!spec.startup.binds["/srv/data"].ro);
    }

    #[test]
    fn empty_build_block_counts_as_absent() {
        let spec: ContainerSpec = serde_yaml::from_str("build: {}\n").unwrap();
        assert!(spec.build_spec().is_none());
        let spec: ContainerSpec = serde_yaml::from_str("build:\n  tag: t\n").unwrap();
        assert!(spec.build_spec().unwrap().is_tagged());
    }
}
