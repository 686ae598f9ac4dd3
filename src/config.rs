//! The configuration directory resolver.
//!
//! A dockhand configuration directory contains `units/` (one subdirectory
//! per unit, with one YAML file per command), `services/` (build contexts)
//! and `environments/` (YAML files merged into the substitution
//! environment).  Unit files are two-document YAML streams: container
//! configurations first, the order list second.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};
use crate::models::{Configurations, OrderEntry};
use crate::orders::{self, DerivedCommand};

/// Commands every unit with a `start.yaml` supports, because they can be
/// derived from it.
const DERIVED_COMMANDS: &[&str] = &[
    "stop", "restart", "cleanup", "purge", "build", "create", "backup", "restore",
];

const README_CANDIDATES: &[&str] = &[
    "README.rst",
    "readme.rst",
    "README",
    "README.md",
    "readme.md",
];

const DEFAULT_ENVIRONMENT: &str = "\
DOCKER_HOST: unix:///var/run/docker.sock
BACKUP_DIR: backups
";

pub struct Configuration {
    base_dir: PathBuf,
}

impl Configuration {
    /// Resolves the configuration directory.  An explicit directory must be
    /// writable; otherwise the first initialized candidate wins, falling
    /// back to the first writable one.
    pub fn new(base_dir: Option<PathBuf>) -> Result<Configuration> {
        let base_dir = match base_dir {
            Some(dir) => {
                if !is_writable(&dir) {
                    return Err(Error::InvalidConfiguration(format!(
                        "configuration directory {} does not exist or is not writable",
                        dir.display()
                    )));
                }
                dir
            }
            None => guess_base_dir()?,
        };
        log::debug!("using configuration directory {}", base_dir.display());
        Ok(Configuration { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn is_initialized(&self) -> bool {
        self.base_dir.join("environments").is_dir()
    }

    /// Absolute path under the configuration directory, if it exists.
    pub fn abspath(&self, relative: &str) -> Option<PathBuf> {
        let path = self.base_dir.join(relative);
        if path.exists() {
            Some(path)
        } else {
            None
        }
    }

    /// Writes the starter skeleton.  Fails when already initialized.
    pub fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::InvalidConfiguration(format!(
                "{} is already initialized",
                self.base_dir.display()
            )));
        }
        for subdir in &["units", "services", "environments", "backups"] {
            fs::create_dir_all(self.base_dir.join(subdir))?;
        }
        fs::write(
            self.base_dir.join("environments").join("default.yaml"),
            DEFAULT_ENVIRONMENT,
        )?;
        log::debug!("wrote initial data to {}", self.base_dir.display());
        Ok(())
    }

    /// The substitution environment: `DOCKHAND_CONF` plus every YAML file
    /// under `environments/`, deep-merged in file-name order.
    pub fn environment(&self) -> Result<Mapping> {
        let mut environment = Mapping::new();
        environment.insert(
            Value::from("DOCKHAND_CONF"),
            Value::from(self.base_dir.display().to_string()),
        );
        if let Some(dir) = self.abspath("environments") {
            let mut entries = fs::read_dir(dir)?
                .collect::<std::io::Result<Vec<_>>>()?;
            entries.sort_by_key(|entry| entry.file_name());
            for entry in entries {
                let path = entry.path();
                if path.extension().map_or(false, |ext| ext == "yaml" || ext == "yml") {
                    merge_environment_file(&mut environment, &path)?;
                }
            }
        }
        Ok(environment)
    }

    /// Loads the configuration for a `unit/command` pair.
    ///
    /// When `units/<unit>/<command>.yaml` is missing the unit's `start.yaml`
    /// is loaded instead and the order list is derived by the transformer;
    /// commands that cannot be derived fail with `InvalidConfiguration`.
    pub fn read_unit_configuration(
        &self,
        unitcommand: &str,
        environment: &Mapping,
    ) -> Result<(Configurations, Vec<OrderEntry>)> {
        let (unit, command) = split_unit_command(unitcommand)?;

        let requested = self.unit_file(unit, command);
        let (path, derived) = match requested {
            Some(path) => (path, None),
            None => {
                let start = self
                    .unit_file(unit, "start")
                    .ok_or_else(|| {
                        Error::InvalidConfiguration(format!(
                            "no configuration for unit command {}",
                            unitcommand
                        ))
                    })?;
                let backup_root = environment
                    .get("BACKUP_DIR")
                    .and_then(Value::as_str)
                    .unwrap_or(".")
                    .to_string();
                let derived = DerivedCommand::parse(command, &backup_root).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "command {} cannot be derived from {}/start",
                        command, unit
                    ))
                })?;
                (start, Some(derived))
            }
        };

        let mut in_progress = HashSet::new();
        let (configurations, order_list) =
            self.load_unit_file(&path, environment, &mut in_progress)?;

        match derived {
            Some(command) => {
                let order_list = orders::transform(&configurations, &order_list, &command);
                Ok((configurations, order_list))
            }
            None => Ok((configurations, order_list)),
        }
    }

    /// The file backing a unit command.  A plain `units/<unit>.yaml` file
    /// is a single-file unit whose only stored command is `start`.
    fn unit_file(&self, unit: &str, command: &str) -> Option<PathBuf> {
        self.abspath(&format!("units/{}/{}.yaml", unit, command))
            .or_else(|| {
                if command == "start" {
                    self.abspath(&format!("units/{}.yaml", unit))
                } else {
                    None
                }
            })
    }

    fn load_unit_file(
        &self,
        path: &Path,
        environment: &Mapping,
        in_progress: &mut HashSet<PathBuf>,
    ) -> Result<(Configurations, Vec<OrderEntry>)> {
        let canonical = path.canonicalize()?;
        if !in_progress.insert(canonical.clone()) {
            return Err(Error::InvalidConfiguration(format!(
                "import cycle detected at {}",
                path.display()
            )));
        }

        let text = fs::read_to_string(path)?;
        let text = substitute_placeholders(&text, environment);

        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            documents.push(Value::deserialize(document)?);
        }
        if documents.len() != 2 {
            return Err(Error::InvalidConfiguration(format!(
                "{} must contain two YAML documents: configurations and an order list",
                path.display()
            )));
        }
        let order_document = documents.pop();
        let mut config_document = match documents.pop() {
            Some(Value::Mapping(mapping)) => mapping,
            _ => {
                return Err(Error::InvalidConfiguration(format!(
                    "{}: the configurations document must be a mapping",
                    path.display()
                )))
            }
        };

        let mut configurations = Configurations::new();
        for import in take_imports(&mut config_document, path)? {
            let (unit, command) = split_unit_command(&import)?;
            let import_path = self.unit_file(unit, command).ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "unresolvable import {} in {}",
                    import,
                    path.display()
                ))
            })?;
            let (imported, _) = self.load_unit_file(&import_path, environment, in_progress)?;
            // later imports override earlier ones
            configurations.extend(imported);
        }

        // the importer wins on conflicts
        let own: Configurations = serde_yaml::from_value(Value::Mapping(config_document))?;
        configurations.extend(own);

        let order_list: Vec<OrderEntry> = match order_document {
            Some(Value::Null) => Vec::new(),
            Some(document) => serde_yaml::from_value(document)?,
            None => Vec::new(),
        };

        in_progress.remove(&canonical);
        Ok((configurations, order_list))
    }

    pub fn list_units(&self, with_commands: bool) -> Result<Vec<String>> {
        let units_dir = self.abspath("units").ok_or_else(|| {
            Error::InvalidConfiguration("no units directory; run 'init' first".to_string())
        })?;

        let mut result = Vec::new();
        for entry in fs::read_dir(units_dir)? {
            let entry = entry?;
            let path = entry.path();
            let mut name = entry.file_name().to_string_lossy().to_string();
            let mut commands = BTreeSet::new();

            if path.is_dir() {
                for file in fs::read_dir(&path)? {
                    let file = file?.path();
                    if file.extension().map_or(false, |ext| ext == "yaml") {
                        if let Some(stem) = file.file_stem() {
                            commands.insert(stem.to_string_lossy().to_string());
                        }
                    }
                }
            } else if path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(stem) = path.file_stem() {
                    name = stem.to_string_lossy().to_string();
                    commands.insert("start".to_string());
                }
            }

            if commands.is_empty() {
                continue;
            }

            if with_commands {
                if commands.contains("start") {
                    commands.extend(DERIVED_COMMANDS.iter().map(|c| c.to_string()));
                }
                commands.remove("globals");
                for command in commands {
                    result.push(format!("{}/{}", name, command));
                }
            } else {
                result.push(name);
            }
        }
        result.sort();
        Ok(result)
    }

    pub fn list_services(&self) -> Result<Vec<String>> {
        let services_dir = self.abspath("services").ok_or_else(|| {
            Error::InvalidConfiguration("no services directory; run 'init' first".to_string())
        })?;

        let mut result = Vec::new();
        for entry in fs::read_dir(services_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join("Dockerfile").exists() {
                result.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        result.sort();
        Ok(result)
    }

    /// The README of a unit or service directory, if one exists.
    pub fn readme(&self, kind: &str, name: &str) -> Option<String> {
        let base = self.base_dir.join(kind).join(name);
        for candidate in README_CANDIDATES {
            let path = base.join(candidate);
            if path.exists() {
                return fs::read_to_string(path).ok();
            }
        }
        None
    }
}

fn guess_base_dir() -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".dockhand"));
    }
    candidates.push(PathBuf::from("/etc/dockhand"));

    for candidate in &candidates {
        if candidate.join("environments").is_dir() {
            return Ok(candidate.clone());
        }
    }
    for candidate in &candidates {
        if let Some(parent) = candidate.parent() {
            if is_writable(parent) {
                fs::create_dir_all(candidate)?;
                return Ok(candidate.clone());
            }
        }
    }
    Err(Error::InvalidConfiguration(
        "no writable configuration directory found".to_string(),
    ))
}

fn is_writable(dir: &Path) -> bool {
    tempfile::tempfile_in(dir).is_ok()
}

/// Splits `unit/command`, keeping nested unit paths intact.
pub fn split_unit_command(unitcommand: &str) -> Result<(&str, &str)> {
    match unitcommand.rfind('/') {
        Some(position) if position > 0 && position + 1 < unitcommand.len() => {
            Ok((&unitcommand[..position], &unitcommand[position + 1..]))
        }
        _ => Err(Error::InvalidConfiguration(format!(
            "{:?} is not a unit/command pair",
            unitcommand
        ))),
    }
}

fn take_imports(mapping: &mut Mapping, path: &Path) -> Result<Vec<String>> {
    match mapping.remove("import") {
        None => Ok(Vec::new()),
        Some(Value::String(import)) => Ok(vec![import]),
        Some(Value::Sequence(imports)) => imports
            .into_iter()
            .map(|import| {
                import.as_str().map(str::to_string).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "{}: imports must be unit/command strings",
                        path.display()
                    ))
                })
            })
            .collect(),
        Some(_) => Err(Error::InvalidConfiguration(format!(
            "{}: 'import' must be a string or a list of strings",
            path.display()
        ))),
    }
}

/// Recursive map merge: mappings merge key-wise, anything else is replaced
/// by the update.
pub fn deepupdate(base: &mut Mapping, update: Mapping) {
    for (key, value) in update {
        if let Value::Mapping(incoming) = value {
            if let Some(Value::Mapping(existing)) = base.get_mut(&key) {
                deepupdate(existing, incoming);
                continue;
            }
            base.insert(key, Value::Mapping(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Merges one YAML environment file into `environment`.
pub fn merge_environment_file(environment: &mut Mapping, path: &Path) -> Result<()> {
    let value: Value = serde_yaml::from_str(&fs::read_to_string(path)?)?;
    match value {
        Value::Mapping(mapping) => {
            deepupdate(environment, mapping);
            Ok(())
        }
        Value::Null => Ok(()),
        _ => Err(Error::InvalidConfiguration(format!(
            "{}: environment files must contain a mapping",
            path.display()
        ))),
    }
}

/// Replaces `{{KEY}}` tokens with the environment's scalar values before
/// the YAML is parsed.  Nested values are not addressable; full template
/// engines are out of scope.
pub fn substitute_placeholders(text: &str, environment: &Mapping) -> String {
    let mut result = text.to_string();
    for (key, value) in environment {
        let key = match key.as_str() {
            Some(key) => key,
            None => continue,
        };
        let replacement = match scalar_to_string(value) {
            Some(replacement) => replacement,
            None => continue,
        };
        result = result.replace(&format!("{{{{{}}}}}", key), &replacement);
        result = result.replace(&format!("{{{{ {} }}}}", key), &replacement);
    }
    result
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(string) => Some(string.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(boolean) => Some(boolean.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerName, Order};
    use tempfile::TempDir;

    fn write_unit(dir: &TempDir, unit: &str, command: &str, content: &str) {
        let unit_dir = dir.path().join("units").join(unit);
        fs::create_dir_all(&unit_dir).unwrap();
        fs::write(unit_dir.join(format!("{}.yaml", command)), content).unwrap();
    }

    fn configuration(dir: &TempDir) -> Configuration {
        Configuration::new(Some(dir.path().to_path_buf())).unwrap()
    }

    const SIMPLE_START: &str = "
web:
  creation:
    image: nginx:latest
---
- web:
    command: start
";

    #[test]
    fn initialize_creates_the_skeleton() {
        let dir = TempDir::new().unwrap();
        let config = configuration(&dir);
        assert!(!config.is_initialized());
        config.initialize().unwrap();
        assert!(config.is_initialized());
        assert!(config.initialize().is_err());
        let env = config.environment().unwrap();
        assert!(env.get("DOCKER_HOST").is_some());
        assert!(env.get("DOCKHAND_CONF").is_some());
    }

    #[test]
    fn environment_files_deep_merge_in_name_order() {
        let dir = TempDir::new().unwrap();
        let env_dir = dir.path().join("environments");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(env_dir.join("a.yaml"), "nested:\n  keep: 1\n  replaced: old\n").unwrap();
        fs::write(env_dir.join("b.yaml"), "nested:\n  replaced: new\ntop: 2\n").unwrap();

        let env = configuration(&dir).environment().unwrap();
        let nested = env.get("nested").unwrap().as_mapping().unwrap();
        assert_eq!(nested.get("keep").unwrap().as_i64(), Some(1));
        assert_eq!(nested.get("replaced").unwrap().as_str(), Some("new"));
        assert_eq!(env.get("top").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn reads_a_two_document_unit_file() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "site", "start", SIMPLE_START);
        let config = configuration(&dir);
        let (configs, orders) = config
            .read_unit_configuration("site/start", &Mapping::new())
            .unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].name, ContainerName::new("web"));
    }

    #[test]
    fn rejects_files_without_two_documents() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "site", "start", "web: {}\n");
        let err = configuration(&dir)
            .read_unit_configuration("site/start", &Mapping::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn substitutes_environment_placeholders() {
        let dir = TempDir::new().unwrap();
        write_unit(
            &dir,
            "site",
            "start",
            "
web:
  creation:
    image: \"nginx:{{NGINX_TAG}}\"
---
- web:
    command: start
",
        );
        let mut env = Mapping::new();
        env.insert(Value::from("NGINX_TAG"), Value::from("1.19"));
        let (configs, _) = configuration(&dir)
            .read_unit_configuration("site/start", &env)
            .unwrap();
        let web = configs.get(&ContainerName::new("web")).unwrap();
        assert_eq!(web.creation.image.as_deref(), Some("nginx:1.19"));
    }

    #[test]
    fn falls_back_to_start_and_derives_the_order_list() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "site", "start", SIMPLE_START);
        let (_, orders) = configuration(&dir)
            .read_unit_configuration("site/stop", &Mapping::new())
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].spec.order, Order::Stop { timeout: 0 });
    }

    #[test]
    fn single_file_units_load_and_derive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("units")).unwrap();
        fs::write(dir.path().join("units").join("solo.yaml"), SIMPLE_START).unwrap();
        let config = configuration(&dir);

        let (configs, _) = config
            .read_unit_configuration("solo/start", &Mapping::new())
            .unwrap();
        assert_eq!(configs.len(), 1);

        let (_, orders) = config
            .read_unit_configuration("solo/stop", &Mapping::new())
            .unwrap();
        assert_eq!(orders[0].spec.order, Order::Stop { timeout: 0 });
    }

    #[test]
    fn underivable_commands_fail() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "site", "start", SIMPLE_START);
        let err = configuration(&dir)
            .read_unit_configuration("site/frobnicate", &Mapping::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn imports_merge_with_importer_precedence() {
        let dir = TempDir::new().unwrap();
        write_unit(
            &dir,
            "base",
            "start",
            "
shared:
  creation:
    image: busybox:latest
overridden:
  creation:
    image: old:1
---
[]
",
        );
        write_unit(
            &dir,
            "site",
            "start",
            "
import: base/start
overridden:
  creation:
    image: new:2
---
- shared:
    command: start
",
        );
        let (configs, _) = configuration(&dir)
            .read_unit_configuration("site/start", &Mapping::new())
            .unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(
            configs[&ContainerName::new("overridden")]
                .creation
                .image
                .as_deref(),
            Some("new:2")
        );
        assert_eq!(
            configs[&ContainerName::new("shared")].creation.image.as_deref(),
            Some("busybox:latest")
        );
    }

    #[test]
    fn import_cycles_are_detected() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "a", "start", "import: b/start\n---\n[]\n");
        write_unit(&dir, "b", "start", "import: a/start\n---\n[]\n");
        let err = configuration(&dir)
            .read_unit_configuration("a/start", &Mapping::new())
            .unwrap_err();
        match err {
            Error::InvalidConfiguration(message) => {
                assert!(message.contains("import cycle"), "message: {}", message)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn diamond_imports_are_not_cycles() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "d", "start", "leaf:\n  creation:\n    image: x\n---\n[]\n");
        write_unit(&dir, "b", "start", "import: d/start\n---\n[]\n");
        write_unit(&dir, "c", "start", "import: d/start\n---\n[]\n");
        write_unit(
            &dir,
            "a",
            "start",
            "import:\n  - b/start\n  - c/start\n---\n[]\n",
        );
        let (configs, _) = configuration(&dir)
            .read_unit_configuration("a/start", &Mapping::new())
            .unwrap();
        assert!(configs.contains_key(&ContainerName::new("leaf")));
    }

    #[test]
    fn lists_units_with_derived_commands() {
        let dir = TempDir::new().unwrap();
        write_unit(&dir, "site", "start", SIMPLE_START);
        write_unit(&dir, "site", "globals", "{}\n---\n[]\n");
        let config = configuration(&dir);

        let plain = config.list_units(false).unwrap();
        assert_eq!(plain, vec!["site"]);

        let with_commands = config.list_units(true).unwrap();
        assert!(with_commands.contains(&"site/start".to_string()));
        assert!(with_commands.contains(&"site/purge".to_string()));
        assert!(!with_commands.contains(&"site/globals".to_string()));
    }

    #[test]
    fn lists_services_with_dockerfiles() {
        let dir = TempDir::new().unwrap();
        let svc = dir.path().join("services").join("proxy");
        fs::create_dir_all(&svc).unwrap();
        fs::write(svc.join("Dockerfile"), "FROM busybox\n").unwrap();
        fs::create_dir_all(dir.path().join("services").join("no-dockerfile")).unwrap();

        let services = configuration(&dir).list_services().unwrap();
        assert_eq!(services, vec!["proxy"]);
    }

    #[test]
    fn split_unit_command_keeps_nested_units() {
        assert_eq!(split_unit_command("a/b").unwrap(), ("a", "b"));
        assert_eq!(split_unit_command("a/b/c").unwrap(), ("a/b", "c"));
        assert!(split_unit_command("nocommand").is_err());
        assert!(split_unit_command("trailing/").is_err());
    }
}
