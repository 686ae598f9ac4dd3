//! The order-list transformation engine.
//!
//! A unit only declares how it starts.  Every other unit command is derived
//! mechanically from the `start` order list: teardown sequences run in
//! reverse dependency order (the last-started container is stopped first),
//! and only images this tool built under an explicit tag are candidates for
//! removal.

use chrono::Local;

use crate::models::{Configurations, ContainerName, Order, OrderEntry};

/// A unit command derivable from a `start` order list.
#[derive(Clone, Debug, PartialEq)]
pub enum DerivedCommand {
    Stop,
    Restart,
    Cleanup,
    Purge,
    Build,
    Create,
    Backup { directory: String },
    Restore { directory: String },
}

impl DerivedCommand {
    /// Maps a command name to a derived command.  `backup_root` seeds the
    /// target directory for the backup/restore variants; every container of
    /// the unit shares one timestamped directory per invocation.
    pub fn parse(command: &str, backup_root: &str) -> Option<DerivedCommand> {
        match command {
            "stop" => Some(DerivedCommand::Stop),
            "restart" => Some(DerivedCommand::Restart),
            "cleanup" => Some(DerivedCommand::Cleanup),
            "purge" => Some(DerivedCommand::Purge),
            "build" => Some(DerivedCommand::Build),
            "create" => Some(DerivedCommand::Create),
            "backup" => Some(DerivedCommand::Backup {
                directory: timestamped(backup_root),
            }),
            "restore" => Some(DerivedCommand::Restore {
                directory: timestamped(backup_root),
            }),
            _ => None,
        }
    }
}

fn timestamped(root: &str) -> String {
    format!("{}/{}", root, Local::now().format("%Y%m%d-%H%M"))
}

/// The three roles a base-list entry can play in a derived teardown.
///
/// Relative order within each bucket matches the base list.  A `build`
/// entry only lands in `builds` when its configuration carries a non-empty
/// `build.tag`; untagged entries are pulled images and must not be removed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classified {
    pub builds: Vec<ContainerName>,
    pub creations: Vec<ContainerName>,
    pub starts: Vec<ContainerName>,
}

/// Classifies the entries of a start-oriented order list in a single scan.
pub fn classify(configurations: &Configurations, order_list: &[OrderEntry]) -> Classified {
    let mut classified = Classified::default();
    for entry in order_list {
        match entry.spec.order {
            Order::Start { .. } => classified.starts.push(entry.name.clone()),
            Order::Create => classified.creations.push(entry.name.clone()),
            Order::Build => {
                let tagged = configurations
                    .get(&entry.name)
                    .and_then(|spec| spec.build_spec())
                    .map_or(false, |build| build.is_tagged());
                if tagged {
                    classified.builds.push(entry.name.clone());
                }
            }
            _ => {}
        }
    }
    classified
}

/// Derives a new order list from a start-oriented one.
///
/// Pure: neither input is mutated, and the same container may legitimately
/// appear several times in the output (once per base-list role).
pub fn transform(
    configurations: &Configurations,
    order_list: &[OrderEntry],
    command: &DerivedCommand,
) -> Vec<OrderEntry> {
    let Classified {
        builds,
        creations,
        starts,
    } = classify(configurations, order_list);

    let mut derived = Vec::new();

    match command {
        DerivedCommand::Restart => {
            for name in starts.iter().rev() {
                derived.push(OrderEntry::new(
                    name.as_str(),
                    Order::Start {
                        restart: true,
                        timeout: 0,
                    },
                ));
            }
        }
        DerivedCommand::Stop => {
            push_stops(&mut derived, &starts);
        }
        DerivedCommand::Cleanup => {
            push_stops(&mut derived, &starts);
            push_removals(&mut derived, &starts, &creations, false);
        }
        DerivedCommand::Purge => {
            push_stops(&mut derived, &starts);
            push_removals(&mut derived, &starts, &creations, true);
            for name in builds.iter().rev() {
                derived.push(OrderEntry::new(
                    name.as_str(),
                    Order::RemoveImage {
                        force: false,
                        noprune: false,
                    },
                ));
            }
        }
        DerivedCommand::Build => {
            for name in &builds {
                derived.push(OrderEntry::new(name.as_str(), Order::Build));
            }
        }
        DerivedCommand::Create => {
            for name in &creations {
                derived.push(OrderEntry::new(name.as_str(), Order::Create));
            }
        }
        DerivedCommand::Backup { directory } => {
            for name in configurations.keys() {
                derived.push(OrderEntry::new(
                    name.as_str(),
                    Order::Backup {
                        backup_dir: directory.clone(),
                        source: "/".to_string(),
                        backup_name: name.as_str().to_string(),
                        overwrite: false,
                    },
                ));
            }
        }
        DerivedCommand::Restore { directory } => {
            for name in configurations.keys() {
                derived.push(OrderEntry::new(
                    name.as_str(),
                    Order::Restore {
                        restore_dir: directory.clone(),
                        restore_name: name.as_str().to_string(),
                    },
                ));
            }
        }
    }

    derived
}

fn push_stops(derived: &mut Vec<OrderEntry>, starts: &[ContainerName]) {
    for name in starts.iter().rev() {
        derived.push(OrderEntry::new(name.as_str(), Order::Stop { timeout: 0 }));
    }
}

fn push_removals(
    derived: &mut Vec<OrderEntry>,
    starts: &[ContainerName],
    creations: &[ContainerName],
    volumes: bool,
) {
    for name in starts.iter().rev().chain(creations.iter().rev()) {
        derived.push(OrderEntry::new(
            name.as_str(),
            Order::Remove {
                v: volumes,
                timeout: 10,
            },
        ));
    }
}
