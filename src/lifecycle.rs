//! Idempotent container lifecycle operations.
//!
//! `ContainerLifecycle` binds one named configuration to a runtime and a
//! sink and exposes the operations an order list can request.  Operations
//! whose goal state already holds (starting a running container, removing
//! an absent one) succeed without touching the runtime.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::{BTreeMap as Map, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::models::{
    BindTarget, BuildSpec, Configurations, ContainerName, ContainerRecord, ContainerSpec,
    CreateRequest, CreationSpec, ImageRecord, Order, OrderEntry, StartupSpec,
};
use crate::services::{ContainerRuntime, OutputSink};
use crate::spawn::spawn_process;
use crate::substitution::substitute_runtime_args;

/// Image used for auxiliary volume-manipulation containers.
const AUXILIARY_IMAGE: &str = "busybox:latest";

pub struct ContainerLifecycle<'a> {
    runtime: &'a mut dyn ContainerRuntime,
    sink: &'a mut dyn OutputSink,
    name: ContainerName,
    creation: CreationSpec,
    startup: StartupSpec,
    build: Option<BuildSpec>,
    config_dir: PathBuf,
}

impl<'a> ContainerLifecycle<'a> {
    /// Binds a configuration to a runtime, normalizing it on the way in:
    /// port-binding keys are unioned into the exposed ports, and bind
    /// sources have `${CONFIG_DIR}` resolved against the configuration
    /// directory.  Absolute bind sources must exist on the host.
    pub fn new(
        runtime: &'a mut dyn ContainerRuntime,
        sink: &'a mut dyn OutputSink,
        name: ContainerName,
        spec: &ContainerSpec,
        config_dir: &Path,
    ) -> Result<ContainerLifecycle<'a>> {
        let mut creation = spec.creation.clone();
        let mut startup = spec.startup.clone();

        let mut exposed: BTreeSet<String> = creation.ports.iter().cloned().collect();
        for port in startup.port_bindings.keys() {
            if exposed.insert(port.clone()) {
                creation.ports.push(port.clone());
            }
        }

        let mut binds = Map::new();
        for (source, target) in &startup.binds {
            let resolved = source.replace("${CONFIG_DIR}", &config_dir.display().to_string());
            // Sources without a leading slash are named volumes; only host
            // paths are checked.
            if resolved.starts_with('/') && !Path::new(&resolved).exists() {
                return Err(Error::InvalidConfiguration(format!(
                    "bind source {} for container {} does not exist",
                    resolved, name
                )));
            }
            binds.insert(resolved, target.clone());
        }
        startup.binds = binds;

        Ok(ContainerLifecycle {
            runtime,
            sink,
            name,
            creation,
            startup,
            build: spec.build_spec().cloned(),
            config_dir: config_dir.to_path_buf(),
        })
    }

    pub fn name(&self) -> &ContainerName {
        &self.name
    }

    fn get_container(&mut self) -> Result<Option<ContainerRecord>> {
        let containers = self.runtime.list_containers(&self.name, true)?;
        Ok(containers
            .into_iter()
            .find(|container| container.name == self.name))
    }

    fn find_image(&mut self, reference: &str) -> Result<Option<ImageRecord>> {
        let (repository, tag) = split_reference(reference);
        let canonical = format!("{}:{}", repository, tag);
        let images = self.runtime.list_images(repository)?;
        Ok(images
            .into_iter()
            .find(|image| image.repo_tags.iter().any(|t| t == &canonical)))
    }

    /// The image reference this configuration resolves to: a tagged build
    /// wins over a pulled image.
    fn image_reference(&self) -> Option<String> {
        if let Some(tag) = self.build.as_ref().and_then(|build| build.tag.clone()) {
            if !tag.is_empty() {
                return Some(tag);
            }
        }
        self.creation.image.as_ref().map(|image| {
            if image.contains(':') {
                image.clone()
            } else {
                let tag = self.creation.tag.as_deref().unwrap_or("latest");
                format!("{}:{}", image, tag)
            }
        })
    }

    /// Whether the container exists and is running.
    pub fn is_started(&mut self) -> Result<bool> {
        Ok(self
            .get_container()?
            .map_or(false, |container| container.running))
    }

    /// Starts the container, creating it first when it does not exist.
    /// With `restart` an existing container is restarted instead.
    pub fn start(&mut self, restart: bool, timeout: u32) -> Result<()> {
        if let Some(container) = self.get_container()? {
            if restart {
                log::info!("restarting container {}", self.name);
                return self.runtime.restart_container(&container.id, timeout);
            }
            if container.running {
                log::debug!("container {} is already running", self.name);
                return Ok(());
            }
            log::info!("starting container {}", self.name);
            return self.runtime.start_container(&container.id);
        }

        self.create().map_err(|error| Error::CreationError {
            name: self.name.to_string(),
            reason: error.to_string(),
        })?;
        log::info!("starting container {}", self.name);
        self.runtime.start_container(self.name.as_str())
    }

    /// Creates the container if it does not exist.  When the runtime
    /// reports a missing image the image is built or pulled and creation is
    /// retried once.
    pub fn create(&mut self) -> Result<()> {
        if self.get_container()?.is_some() {
            log::debug!("container {} already exists", self.name);
            return Ok(());
        }

        let image = self.image_reference().ok_or(Error::NoImageSpecified)?;
        let request = self.create_request(&image);

        match self.runtime.create_container(&request) {
            Ok(id) => {
                log::info!("created container {} ({})", self.name, id);
                Ok(())
            }
            Err(Error::Runtime(message)) if message.contains("No such image") => {
                log::info!("image {} is missing, providing it first", image);
                self.build_image()?;
                let id = self.runtime.create_container(&request)?;
                log::info!("created container {} ({})", self.name, id);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn create_request(&self, image: &str) -> CreateRequest {
        CreateRequest {
            name: Some(self.name.clone()),
            image: image.to_string(),
            command: self.creation.command.clone(),
            ports: self.creation.ports.clone(),
            binds: self.startup.binds.clone(),
            port_bindings: self.startup.port_bindings.clone(),
            volumes_from: self.startup.volumes_from.clone(),
            extra: self.creation.extra.clone(),
        }
    }

    /// Provides the configured image: a no-op when it is already present,
    /// otherwise a build when instructions exist, otherwise a pull.
    pub fn build_image(&mut self) -> Result<()> {
        if let Some(reference) = self.image_reference() {
            if self.find_image(&reference)?.is_some() {
                log::debug!("image {} is already present", reference);
                return Ok(());
            }
        }

        if let Some(build) = self.build.clone() {
            log::info!(
                "building image for container {} from {}",
                self.name,
                build.path.as_deref().unwrap_or(".")
            );
            return self.runtime.build_image(&build, &mut *self.sink);
        }

        match self.creation.image.clone() {
            Some(image) => {
                let reference = if image.contains(':') {
                    image
                } else {
                    let tag = self.creation.tag.as_deref().unwrap_or("latest");
                    format!("{}:{}", image, tag)
                };
                let (repository, tag) = split_reference(&reference);
                log::info!("pulling image {}:{}", repository, tag);
                self.runtime.pull_image(repository, tag, &mut *self.sink)
            }
            None => Err(Error::NoBuildInstructions {
                image: self.name.to_string(),
                reason: "the configuration has neither build instructions nor an image reference"
                    .to_string(),
            }),
        }
    }

    /// Stops the container.  Absent or stopped containers are a no-op.
    pub fn stop(&mut self, timeout: u32) -> Result<()> {
        match self.get_container()? {
            Some(container) if container.running => {
                log::info!("stopping container {}", self.name);
                self.runtime.stop_container(&container.id, timeout)
            }
            Some(_) => {
                log::debug!("container {} is already stopped", self.name);
                Ok(())
            }
            None => {
                log::debug!("container {} does not exist", self.name);
                Ok(())
            }
        }
    }

    /// Removes the container, stopping it first.  Without `volumes` the
    /// removal is skipped when it would orphan a volume that neither the
    /// binds nor the borrowed volumes account for.
    pub fn remove(&mut self, volumes: bool, timeout: u32) -> Result<()> {
        let container = match self.get_container()? {
            Some(container) => container,
            None => {
                log::debug!("container {} does not exist", self.name);
                return Ok(());
            }
        };

        self.stop(timeout)?;

        if !volumes {
            let record = self.runtime.inspect_container(&container.id)?;
            if let Some(volume) = self.unaccounted_volume(&record)? {
                log::warn!(
                    "not removing container {}: volume {} would be orphaned",
                    self.name,
                    volume
                );
                return Ok(());
            }
        }

        log::info!("removing container {}", self.name);
        self.runtime.remove_container(&container.id, volumes)
    }

    /// The first of the container's volumes that is neither a bind mount
    /// target nor borrowed from another container.
    fn unaccounted_volume(&mut self, record: &Value) -> Result<Option<String>> {
        let mut accounted = BTreeSet::new();

        if let Some(binds) = record.pointer("/HostConfig/Binds").and_then(Value::as_array) {
            for bind in binds.iter().filter_map(Value::as_str) {
                // host:container[:options]
                if let Some(container_path) = bind.split(':').nth(1) {
                    accounted.insert(container_path.to_string());
                }
            }
        }

        if let Some(sources) = record
            .pointer("/HostConfig/VolumesFrom")
            .and_then(Value::as_array)
        {
            for source in sources.iter().filter_map(Value::as_str) {
                let source = source.split(':').next().unwrap_or(source);
                let other = self.runtime.inspect_container(source)?;
                accounted.extend(container_volumes(&other));
            }
        }

        Ok(container_volumes(record)
            .into_iter()
            .find(|volume| !accounted.contains(volume)))
    }

    /// Removes the configured image.  A no-op when the runtime does not
    /// have it.
    pub fn remove_image(&mut self, force: bool, noprune: bool) -> Result<()> {
        let reference = self.image_reference().ok_or(Error::NoImageSpecified)?;
        match self.find_image(&reference)? {
            Some(_) => {
                log::info!("removing image {}", reference);
                self.runtime.remove_image(&reference, force, noprune)
            }
            None => {
                log::debug!("image {} is not present", reference);
                Ok(())
            }
        }
    }

    /// Runs a one-shot auxiliary container that borrows this container's
    /// volumes, delivering its output to the sink.  The auxiliary container
    /// is removed whether the command succeeds or not.
    pub fn manipulate_volumes(
        &mut self,
        command: Vec<String>,
        binds: Map<String, BindTarget>,
        borrow_read_only: bool,
    ) -> Result<()> {
        if self.find_image(AUXILIARY_IMAGE)?.is_none() {
            let (repository, tag) = split_reference(AUXILIARY_IMAGE);
            self.runtime.pull_image(repository, tag, &mut *self.sink)?;
        }

        let borrowed = if borrow_read_only {
            format!("{}:ro", self.name)
        } else {
            self.name.to_string()
        };
        let request = CreateRequest {
            name: None,
            image: AUXILIARY_IMAGE.to_string(),
            command: Some(command.clone()),
            binds,
            volumes_from: vec![borrowed],
            ..CreateRequest::default()
        };
        let id = self.runtime.create_container(&request)?;
        log::debug!("running {:?} in auxiliary container {}", command, id);

        let outcome = self.run_to_completion(&id, &command);
        if let Err(error) = self.runtime.remove_container(&id, false) {
            log::warn!("failed to remove auxiliary container {}: {}", id, error);
        }
        outcome
    }

    fn run_to_completion(&mut self, id: &str, command: &[String]) -> Result<()> {
        self.runtime.start_container(id)?;
        let code = self.runtime.wait_container(id)?;

        let label = command.first().cloned().unwrap_or_default();
        let stdout = self.runtime.container_logs(id, true, false, None)?;
        for line in stdout.lines() {
            self.sink.line(&label, line);
        }

        if code != 0 {
            let stderr = self.runtime.container_logs(id, false, true, Some(3))?;
            return Err(Error::VolumeOperationFailed {
                command: command.to_vec(),
                code,
                stderr,
            });
        }
        Ok(())
    }

    /// Backup and restore directories may use `${CONFIG_DIR}`; relative
    /// paths resolve against the working directory.
    fn resolve_directory(&self, raw: &str) -> Result<PathBuf> {
        let resolved = raw.replace("${CONFIG_DIR}", &self.config_dir.display().to_string());
        absolutize(&resolved)
    }

    /// Archives `source` from the container's volumes into
    /// `backup_dir/backup_name.tar.gz` on the host.
    pub fn backup(
        &mut self,
        backup_dir: &str,
        source: &str,
        backup_name: &str,
        overwrite: bool,
    ) -> Result<()> {
        let directory = self.resolve_directory(backup_dir)?;
        fs::create_dir_all(&directory)?;

        let tar = directory.join(format!("{}.tar", backup_name));
        let archive = directory.join(format!("{}.tar.gz", backup_name));
        if !overwrite && (tar.exists() || archive.exists()) {
            return Err(Error::BackupConflict {
                name: backup_name.to_string(),
                directory: directory.display().to_string(),
            });
        }

        let mut binds = Map::new();
        binds.insert(
            directory.display().to_string(),
            BindTarget {
                bind: "/backup".to_string(),
                ro: false,
            },
        );
        let command = vec![
            "tar".to_string(),
            "cvf".to_string(),
            format!("/backup/{}.tar", backup_name),
            source.to_string(),
        ];

        log::info!(
            "backing up {} of container {} to {}",
            source,
            self.name,
            archive.display()
        );
        self.manipulate_volumes(command, binds, true)?;

        gzip_file(&tar, &archive)?;
        fs::remove_file(&tar)?;
        Ok(())
    }

    /// Restores a backup archive into the container's volumes.  A
    /// compressed archive is decompressed to a scratch tar which is removed
    /// afterwards; the archive itself is left untouched.
    pub fn restore(&mut self, restore_dir: &str, restore_name: &str) -> Result<()> {
        let directory = self.resolve_directory(restore_dir)?;
        let tar = directory.join(format!("{}.tar", restore_name));
        let archive = directory.join(format!("{}.tar.gz", restore_name));

        let scratch = if archive.exists() {
            gunzip_file(&archive, &tar)?;
            true
        } else if tar.exists() {
            false
        } else {
            return Err(Error::InvalidConfiguration(format!(
                "no backup archive for {} in {}",
                restore_name,
                directory.display()
            )));
        };

        let mut binds = Map::new();
        binds.insert(
            directory.display().to_string(),
            BindTarget {
                bind: "/backup".to_string(),
                ro: true,
            },
        );
        let command = vec![
            "tar".to_string(),
            "xf".to_string(),
            format!("/backup/{}.tar", restore_name),
        ];

        log::info!(
            "restoring container {} from {}",
            self.name,
            directory.display()
        );
        let outcome = self.manipulate_volumes(command, binds, false);

        if scratch {
            if let Err(error) = fs::remove_file(&tar) {
                log::warn!("failed to remove scratch archive {}: {}", tar.display(), error);
            }
        }
        outcome
    }

    /// Executes a command.  The `host` pseudo-container runs on the local
    /// machine; everything else runs in an auxiliary container with access
    /// to this container's volumes.
    ///
    /// Inspection expressions in the arguments are evaluated first and the
    /// rewritten command line is reported through the sink, but the
    /// original tokens are what gets dispatched.
    pub fn execute(
        &mut self,
        run: Vec<String>,
        shell: bool,
        binds: Map<String, BindTarget>,
    ) -> Result<()> {
        let label = run.first().cloned().unwrap_or_default();

        let substituted = substitute_runtime_args(&mut *self.runtime, &self.name, &run)?;
        if substituted != run {
            self.sink.line(&label, &substituted.join(" "));
        }

        if self.name.is_host() {
            let sink = &mut *self.sink;
            let mut errors = Vec::new();
            let cwd = self.config_dir.clone();
            let code = spawn_process(
                &run,
                shell,
                Some(&cwd),
                |line| sink.line(&label, line),
                |line| errors.push(line.to_string()),
            )?;
            for line in errors {
                self.sink.line(&label, &line);
            }
            if code != 0 {
                return Err(Error::ExecutionFailed {
                    command: run,
                    code,
                    cwd: cwd.display().to_string(),
                });
            }
            Ok(())
        } else {
            self.manipulate_volumes(run, binds, false)
        }
    }
}

/// Runs an order list against a runtime, entry by entry.  Entries naming
/// the `host` pseudo-container may run without a configuration, but only
/// for `execute`.
pub fn run_order_list(
    runtime: &mut dyn ContainerRuntime,
    sink: &mut dyn OutputSink,
    config_dir: &Path,
    configurations: &Configurations,
    order_list: &[OrderEntry],
) -> Result<()> {
    for entry in order_list {
        let spec = match configurations.get(&entry.name) {
            Some(spec) => spec.clone(),
            None if entry.name.is_host() => ContainerSpec::default(),
            None => {
                return Err(Error::InvalidConfiguration(format!(
                    "the order list names an unconfigured container {}",
                    entry.name
                )))
            }
        };

        if entry.name.is_host() && !matches!(entry.spec.order, Order::Execute { .. }) {
            return Err(Error::InvalidConfiguration(
                "only execute orders may target the host".to_string(),
            ));
        }

        let mut lifecycle = ContainerLifecycle::new(
            &mut *runtime,
            &mut *sink,
            entry.name.clone(),
            &spec,
            config_dir,
        )?;
        dispatch(&mut lifecycle, &entry.spec.order)?;

        if entry.spec.wait > 0 {
            log::debug!("waiting {} seconds before the next order", entry.spec.wait);
            thread::sleep(Duration::from_secs(entry.spec.wait));
        }
    }
    Ok(())
}

fn dispatch(lifecycle: &mut ContainerLifecycle, order: &Order) -> Result<()> {
    match order.clone() {
        Order::Build => lifecycle.build_image(),
        Order::Create => lifecycle.create(),
        Order::Start { restart, timeout } => lifecycle.start(restart, timeout),
        Order::Stop { timeout } => lifecycle.stop(timeout),
        Order::Remove { v, timeout } => lifecycle.remove(v, timeout),
        Order::RemoveImage { force, noprune } => lifecycle.remove_image(force, noprune),
        Order::Backup {
            backup_dir,
            source,
            backup_name,
            overwrite,
        } => lifecycle.backup(&backup_dir, &source, &backup_name, overwrite),
        Order::Restore {
            restore_dir,
            restore_name,
        } => lifecycle.restore(&restore_dir, &restore_name),
        Order::Execute { run, shell, binds } => lifecycle.execute(run, shell, binds),
    }
}

fn container_volumes(record: &Value) -> Vec<String> {
    if let Some(volumes) = record.pointer("/Config/Volumes").and_then(Value::as_object) {
        return volumes.keys().cloned().collect();
    }
    if let Some(volumes) = record.get("Volumes").and_then(Value::as_object) {
        return volumes.keys().cloned().collect();
    }
    record
        .get("Mounts")
        .and_then(Value::as_array)
        .map(|mounts| {
            mounts
                .iter()
                .filter_map(|mount| {
                    mount
                        .get("Destination")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rfind(':') {
        // a colon followed by a slash is a registry port, not a tag
        Some(position) if !reference[position + 1..].contains('/') => {
            (&reference[..position], &reference[position + 1..])
        }
        _ => (reference, "latest"),
    }
}

fn absolutize(directory: &str) -> Result<PathBuf> {
    let path = PathBuf::from(directory);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn gzip_file(source: &Path, target: &Path) -> Result<()> {
    let mut input = fs::File::open(source)?;
    let output = fs::File::create(target)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn gunzip_file(source: &Path, target: &Path) -> Result<()> {
    let input = fs::File::open(source)?;
    let mut decoder = GzDecoder::new(input);
    let mut output = fs::File::create(target)?;
    io::copy(&mut decoder, &mut output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_reference_handles_registries_and_tags() {
        assert_eq!(split_reference("nginx:1.19"), ("nginx", "1.19"));
        assert_eq!(split_reference("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_reference("registry:5000/app"),
            ("registry:5000/app", "latest")
        );
        assert_eq!(
            split_reference("registry:5000/app:v2"),
            ("registry:5000/app", "v2")
        );
    }

    #[test]
    fn container_volumes_prefers_config_volumes() {
        let record = serde_json::json!({
            "Config": {"Volumes": {"/data": {}}},
            "Mounts": [{"Destination": "/ignored"}],
        });
        assert_eq!(container_volumes(&record), vec!["/data"]);
    }

    #[test]
    fn container_volumes_falls_back_to_mounts() {
        let record = serde_json::json!({
            "Mounts": [{"Destination": "/data"}, {"Destination": "/logs"}],
        });
        assert_eq!(container_volumes(&record), vec!["/data", "/logs"]);
    }
}
