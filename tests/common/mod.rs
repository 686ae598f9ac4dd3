#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use dockhand::errors::{Error, Result};
use dockhand::models::{
    BuildSpec, ContainerName, ContainerRecord, ContainerSpec, CreateRequest, ImageRecord,
};
use dockhand::services::{ContainerRuntime, OutputSink};

/// In-memory runtime double.  Mutating calls are appended to `calls` so
/// tests can assert on operation sequences; listing calls are not logged.
#[derive(Default)]
pub struct MockRuntime {
    pub images: Vec<ImageRecord>,
    pub containers: Vec<MockContainer>,
    pub created: Vec<CreateRequest>,
    pub calls: Vec<String>,
    pub wait_codes: VecDeque<i64>,
    pub logs: String,
    pub stderr_logs: String,
    pub inspections: HashMap<String, Value>,
    next_id: u32,
}

pub struct MockContainer {
    pub id: String,
    pub name: Option<ContainerName>,
    pub running: bool,
    pub request: CreateRequest,
}

impl MockContainer {
    fn matches(&self, reference: &str) -> bool {
        self.id == reference
            || self
                .name
                .as_ref()
                .map_or(false, |name| name.as_str() == reference)
    }
}

impl MockRuntime {
    pub fn new() -> MockRuntime {
        MockRuntime::default()
    }

    pub fn add_image(&mut self, reference: &str) {
        self.images.push(ImageRecord {
            id: format!("img-{}", self.images.len()),
            repo_tags: vec![reference.to_string()],
        });
    }

    pub fn add_container(&mut self, name: &str, running: bool) -> String {
        self.next_id += 1;
        let id = format!("id-{}", self.next_id);
        self.containers.push(MockContainer {
            id: id.clone(),
            name: Some(ContainerName::new(name)),
            running,
            request: CreateRequest::default(),
        });
        id
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers
            .iter()
            .filter_map(|container| container.name.as_ref().map(|name| name.to_string()))
            .collect()
    }

    fn find(&mut self, reference: &str) -> Result<&mut MockContainer> {
        self.containers
            .iter_mut()
            .find(|container| container.matches(reference))
            .ok_or_else(|| Error::Runtime(format!("No such container: {}", reference)))
    }
}

impl ContainerRuntime for MockRuntime {
    fn list_images(&mut self, repository: &str) -> Result<Vec<ImageRecord>> {
        let prefix = format!("{}:", repository);
        Ok(self
            .images
            .iter()
            .filter(|image| image.repo_tags.iter().any(|tag| tag.starts_with(&prefix)))
            .cloned()
            .collect())
    }

    fn list_containers(&mut self, name: &ContainerName, all: bool) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .containers
            .iter()
            .filter(|container| container.name.as_ref() == Some(name))
            .filter(|container| all || container.running)
            .map(|container| ContainerRecord {
                id: container.id.clone(),
                name: name.clone(),
                running: container.running,
            })
            .collect())
    }

    fn inspect_container(&mut self, reference: &str) -> Result<Value> {
        if let Some(record) = self.inspections.get(reference) {
            return Ok(record.clone());
        }
        let container = self.find(reference)?;
        Ok(json!({
            "Id": container.id,
            "State": {"Running": container.running},
        }))
    }

    fn inspect_image(&mut self, reference: &str) -> Result<Value> {
        self.inspections
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::Runtime(format!("No such image: {}", reference)))
    }

    fn create_container(&mut self, request: &CreateRequest) -> Result<String> {
        let label = request
            .name
            .as_ref()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "<anonymous>".to_string());
        self.calls.push(format!("create {}", label));

        let known = self
            .images
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == &request.image));
        if !known {
            return Err(Error::Runtime(format!("No such image: {}", request.image)));
        }

        self.next_id += 1;
        let id = format!("id-{}", self.next_id);
        self.created.push(request.clone());
        self.containers.push(MockContainer {
            id: id.clone(),
            name: request.name.clone(),
            running: false,
            request: request.clone(),
        });
        Ok(id)
    }

    fn start_container(&mut self, reference: &str) -> Result<()> {
        self.calls.push(format!("start {}", reference));
        let container = self.find(reference)?;
        container.running = true;

        // emulate the side effect of the auxiliary tar command: a `tar cvf
        // /backup/X.tar ...` drops X.tar into the directory bound to
        // /backup
        if let Some(command) = container.request.command.clone() {
            if command.len() >= 3 && command[0] == "tar" && command[1] == "cvf" {
                if let Some(file) = command[2].strip_prefix("/backup/") {
                    let target = container
                        .request
                        .binds
                        .iter()
                        .find(|(_, target)| target.bind == "/backup")
                        .map(|(source, _)| Path::new(source).join(file));
                    if let Some(target) = target {
                        std::fs::write(target, b"tar archive bytes").unwrap();
                    }
                }
            }
        }
        Ok(())
    }

    fn restart_container(&mut self, reference: &str, timeout: u32) -> Result<()> {
        self.calls.push(format!("restart {} t={}", reference, timeout));
        self.find(reference)?.running = true;
        Ok(())
    }

    fn stop_container(&mut self, reference: &str, timeout: u32) -> Result<()> {
        self.calls.push(format!("stop {} t={}", reference, timeout));
        self.find(reference)?.running = false;
        Ok(())
    }

    fn remove_container(&mut self, reference: &str, volumes: bool) -> Result<()> {
        self.calls.push(format!("rm {} v={}", reference, volumes));
        let position = self
            .containers
            .iter()
            .position(|container| container.matches(reference))
            .ok_or_else(|| Error::Runtime(format!("No such container: {}", reference)))?;
        self.containers.remove(position);
        Ok(())
    }

    fn remove_image(&mut self, reference: &str, _force: bool, _noprune: bool) -> Result<()> {
        self.calls.push(format!("rmi {}", reference));
        self.images
            .retain(|image| !image.repo_tags.iter().any(|tag| tag == reference));
        Ok(())
    }

    fn build_image(&mut self, build: &BuildSpec, sink: &mut dyn OutputSink) -> Result<()> {
        let tag = build.tag.clone().unwrap_or_default();
        self.calls.push(format!("build {}", tag));
        sink.line("build", "Step 1/1 : FROM scratch");
        if !tag.is_empty() {
            self.add_image(&tag);
        }
        Ok(())
    }

    fn pull_image(&mut self, repository: &str, tag: &str, sink: &mut dyn OutputSink) -> Result<()> {
        self.calls.push(format!("pull {}:{}", repository, tag));
        sink.line("pull", "Downloaded newer image");
        self.add_image(&format!("{}:{}", repository, tag));
        Ok(())
    }

    fn container_logs(
        &mut self,
        _reference: &str,
        stdout: bool,
        stderr: bool,
        _tail: Option<u32>,
    ) -> Result<String> {
        let mut result = String::new();
        if stdout {
            result.push_str(&self.logs);
        }
        if stderr {
            if !result.is_empty() && !self.stderr_logs.is_empty() {
                result.push('\n');
            }
            result.push_str(&self.stderr_logs);
        }
        Ok(result)
    }

    fn wait_container(&mut self, reference: &str) -> Result<i64> {
        self.calls.push(format!("wait {}", reference));
        Ok(self.wait_codes.pop_front().unwrap_or(0))
    }
}

/// Sink that records every delivered line.
#[derive(Default)]
pub struct RecordingSink {
    pub lines: Vec<(String, String)>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        RecordingSink::default()
    }

    pub fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|(_, line)| line.as_str()).collect()
    }
}

impl OutputSink for RecordingSink {
    fn line(&mut self, command: &str, line: &str) {
        self.lines.push((command.to_string(), line.to_string()));
    }
}

pub fn spec_with_image(image: &str) -> ContainerSpec {
    let mut spec = ContainerSpec::default();
    spec.creation.image = Some(image.to_string());
    spec
}

pub fn spec_with_build(path: &str, tag: &str) -> ContainerSpec {
    let mut spec = ContainerSpec::default();
    spec.build = Some(BuildSpec {
        path: Some(path.to_string()),
        tag: Some(tag.to_string()),
        ..BuildSpec::default()
    });
    spec
}
