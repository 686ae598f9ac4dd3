use serde_json::Value;

use crate::errors::Result;
use crate::models::{BuildSpec, ContainerName, ContainerRecord, CreateRequest, ImageRecord};

/// The container runtime capability consumed by the lifecycle layer.
///
/// Implementations are thin transport wrappers; all orchestration decisions
/// (idempotence, safety checks, retries) live in `ContainerLifecycle`.
/// Existence is never cached: every operation re-queries the runtime.
pub trait ContainerRuntime {
    /// All images whose repository matches `repository` (tag-insensitive).
    fn list_images(&mut self, repository: &str) -> Result<Vec<ImageRecord>>;

    /// Containers matching `name` exactly (anchored match, not substring),
    /// including stopped ones when `all` is set.
    fn list_containers(&mut self, name: &ContainerName, all: bool) -> Result<Vec<ContainerRecord>>;

    fn inspect_container(&mut self, reference: &str) -> Result<Value>;

    fn inspect_image(&mut self, reference: &str) -> Result<Value>;

    /// Creates a container and returns its id.
    fn create_container(&mut self, request: &CreateRequest) -> Result<String>;

    fn start_container(&mut self, reference: &str) -> Result<()>;

    fn restart_container(&mut self, reference: &str, timeout: u32) -> Result<()>;

    fn stop_container(&mut self, reference: &str, timeout: u32) -> Result<()>;

    fn remove_container(&mut self, reference: &str, volumes: bool) -> Result<()>;

    fn remove_image(&mut self, reference: &str, force: bool, noprune: bool) -> Result<()>;

    /// Runs a build, delivering output lines to `sink` as they arrive.
    fn build_image(&mut self, build: &BuildSpec, sink: &mut dyn OutputSink) -> Result<()>;

    /// Pulls `repository:tag`, delivering output lines to `sink`.
    fn pull_image(&mut self, repository: &str, tag: &str, sink: &mut dyn OutputSink) -> Result<()>;

    /// Log output of a container, restricted to the selected streams.
    fn container_logs(
        &mut self,
        reference: &str,
        stdout: bool,
        stderr: bool,
        tail: Option<u32>,
    ) -> Result<String>;

    /// Blocks until the container exits and returns its exit code.
    fn wait_container(&mut self, reference: &str) -> Result<i64>;
}

/// Destination for streamed command output (build, pull, execute, volume
/// manipulation).  Injected at construction so tests can capture output
/// without touching global logging state.
pub trait OutputSink {
    fn line(&mut self, command: &str, line: &str);
}

/// Sink that forwards everything to the `log` facade at info level.
pub struct LogSink;

impl OutputSink for LogSink {
    fn line(&mut self, command: &str, line: &str) {
        log::info!("[{}] {}", command, line);
    }
}
