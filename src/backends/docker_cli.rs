//! Runtime backend that shells out to the `docker` CLI.
//!
//! The daemon is reached through the CLI rather than the HTTP API, so the
//! backend works against anything with a docker-compatible client (docker,
//! podman via `podman-docker`).  Listing commands use `--format {{json .}}`
//! and parse one JSON record per line.

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::models::{BindTarget, BuildSpec, ContainerName, ContainerRecord, CreateRequest, ImageRecord};
use crate::services::{ContainerRuntime, OutputSink};
use crate::spawn::spawn_process;

const JSON_FORMAT: &str = "{{json .}}";

pub struct DockerCliRuntime {
    program: String,
    host: Option<String>,
}

impl DockerCliRuntime {
    pub fn new(host: Option<String>) -> DockerCliRuntime {
        DockerCliRuntime {
            program: "docker".to_string(),
            host,
        }
    }

    fn argv(&self, args: Vec<String>) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        if let Some(host) = &self.host {
            argv.push("-H".to_string());
            argv.push(host.clone());
        }
        argv.extend(args);
        argv
    }

    fn capture(&mut self, args: Vec<String>) -> Result<(i32, String, String)> {
        let argv = self.argv(args);
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = spawn_process(
            &argv,
            false,
            None,
            |line| out.push(line.to_string()),
            |line| err.push(line.to_string()),
        )
        .map_err(|error| match error {
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::RuntimeUnavailable(format!("{} is not installed", self.program))
            }
            other => other,
        })?;
        Ok((code, out.join("\n"), err.join("\n")))
    }

    fn run(&mut self, args: Vec<String>) -> Result<String> {
        let (code, out, err) = self.capture(args)?;
        if code != 0 {
            if err.is_empty() {
                return Err(Error::Runtime(format!("exit code {}", code)));
            }
            return Err(Error::Runtime(err));
        }
        Ok(out)
    }

    fn run_streaming(
        &mut self,
        args: Vec<String>,
        label: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<()> {
        let argv = self.argv(args);
        let mut err = Vec::new();
        let code = spawn_process(
            &argv,
            false,
            None,
            |line| sink.line(label, line),
            |line| err.push(line.to_string()),
        )
        .map_err(|error| match error {
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::RuntimeUnavailable(format!("{} is not installed", self.program))
            }
            other => other,
        })?;
        // docker streams progress on stderr even on success
        for line in &err {
            sink.line(label, line);
        }
        if code != 0 {
            return Err(Error::Runtime(err.join("\n")));
        }
        Ok(())
    }

    fn inspect(&mut self, kind: &str, reference: &str) -> Result<Value> {
        let out = self.run(args(&["inspect", "--type", kind, reference]))?;
        let value: Value = serde_json::from_str(&out)?;
        match value {
            Value::Array(mut records) if !records.is_empty() => Ok(records.remove(0)),
            _ => Err(Error::Runtime(format!(
                "inspect returned no record for {} {}",
                kind, reference
            ))),
        }
    }
}

impl ContainerRuntime for DockerCliRuntime {
    fn list_images(&mut self, repository: &str) -> Result<Vec<ImageRecord>> {
        let out = self.run(args(&["image", "ls", "--format", JSON_FORMAT, repository]))?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_image_line)
            .collect()
    }

    fn list_containers(&mut self, name: &ContainerName, all: bool) -> Result<Vec<ContainerRecord>> {
        let filter = format!("name=^{}$", name);
        let mut cli = args(&["ps", "--filter", &filter, "--format", JSON_FORMAT]);
        if all {
            cli.insert(1, "-a".to_string());
        }
        let out = self.run(cli)?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_container_line)
            .collect()
    }

    fn inspect_container(&mut self, reference: &str) -> Result<Value> {
        self.inspect("container", reference)
    }

    fn inspect_image(&mut self, reference: &str) -> Result<Value> {
        self.inspect("image", reference)
    }

    fn create_container(&mut self, request: &CreateRequest) -> Result<String> {
        let cli = create_args(request)?;
        let out = self.run(cli)?;
        Ok(out.trim().to_string())
    }

    fn start_container(&mut self, reference: &str) -> Result<()> {
        self.run(args(&["start", reference])).map(|_| ())
    }

    fn restart_container(&mut self, reference: &str, timeout: u32) -> Result<()> {
        self.run(args(&["restart", "-t", &timeout.to_string(), reference]))
            .map(|_| ())
    }

    fn stop_container(&mut self, reference: &str, timeout: u32) -> Result<()> {
        self.run(args(&["stop", "-t", &timeout.to_string(), reference]))
            .map(|_| ())
    }

    fn remove_container(&mut self, reference: &str, volumes: bool) -> Result<()> {
        let mut cli = args(&["rm"]);
        if volumes {
            cli.push("-v".to_string());
        }
        cli.push(reference.to_string());
        self.run(cli).map(|_| ())
    }

    fn remove_image(&mut self, reference: &str, force: bool, noprune: bool) -> Result<()> {
        let mut cli = args(&["rmi"]);
        if force {
            cli.push("-f".to_string());
        }
        if noprune {
            cli.push("--no-prune".to_string());
        }
        cli.push(reference.to_string());
        self.run(cli).map(|_| ())
    }

    fn build_image(&mut self, build: &BuildSpec, sink: &mut dyn OutputSink) -> Result<()> {
        let mut cli = args(&["build"]);
        if let Some(tag) = &build.tag {
            if !tag.is_empty() {
                cli.push("-t".to_string());
                cli.push(tag.clone());
            }
        }
        if build.rm == Some(false) {
            cli.push("--rm=false".to_string());
        }
        cli.push(build.path.clone().unwrap_or_else(|| ".".to_string()));
        self.run_streaming(cli, "build", sink)
    }

    fn pull_image(&mut self, repository: &str, tag: &str, sink: &mut dyn OutputSink) -> Result<()> {
        let reference = format!("{}:{}", repository, tag);
        self.run_streaming(args(&["pull", &reference]), "pull", sink)
    }

    fn container_logs(
        &mut self,
        reference: &str,
        stdout: bool,
        stderr: bool,
        tail: Option<u32>,
    ) -> Result<String> {
        let mut cli = args(&["logs"]);
        if let Some(tail) = tail {
            cli.push("--tail".to_string());
            cli.push(tail.to_string());
        }
        cli.push(reference.to_string());
        let (code, out, err) = self.capture(cli)?;
        if code != 0 {
            return Err(Error::Runtime(err));
        }

        // the daemon multiplexes the container's stdout and stderr onto
        // the client's matching streams
        let mut result = String::new();
        if stdout {
            result.push_str(&out);
        }
        if stderr && !err.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&err);
        }
        Ok(result)
    }

    fn wait_container(&mut self, reference: &str) -> Result<i64> {
        let out = self.run(args(&["wait", reference]))?;
        out.trim()
            .parse::<i64>()
            .map_err(|_| Error::Runtime(format!("unparsable wait result {:?}", out.trim())))
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn parse_image_line(line: &str) -> Result<ImageRecord> {
    let record: Value = serde_json::from_str(line)?;
    let repository = record.get("Repository").and_then(Value::as_str).unwrap_or("");
    let tag = record.get("Tag").and_then(Value::as_str).unwrap_or("<none>");
    let repo_tags = if repository.is_empty() || tag == "<none>" {
        Vec::new()
    } else {
        vec![format!("{}:{}", repository, tag)]
    };
    Ok(ImageRecord {
        id: record
            .get("ID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        repo_tags,
    })
}

fn parse_container_line(line: &str) -> Result<ContainerRecord> {
    let record: Value = serde_json::from_str(line)?;
    let name = record
        .get("Names")
        .and_then(Value::as_str)
        .unwrap_or_default();
    // `Names` can hold several slash-separated aliases; the first is the
    // container's own name
    let name = name.split(',').next().unwrap_or(name).trim_start_matches('/');
    let state = record
        .get("State")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(ContainerRecord {
        id: record
            .get("ID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        name: ContainerName::new(name),
        running: state == "running",
    })
}

fn create_args(request: &CreateRequest) -> Result<Vec<String>> {
    // --pull never keeps the missing-image error visible so the lifecycle
    // can build or pull on its own terms
    let mut cli = args(&["create", "--pull", "never"]);

    if let Some(name) = &request.name {
        cli.push("--name".to_string());
        cli.push(name.to_string());
    }
    for port in &request.ports {
        cli.push("--expose".to_string());
        cli.push(port.clone());
    }
    for (port, binding) in &request.port_bindings {
        cli.push("-p".to_string());
        cli.push(publish_flag(port, binding)?);
    }
    for (source, target) in &request.binds {
        cli.push("-v".to_string());
        cli.push(bind_flag(source, target));
    }
    for source in &request.volumes_from {
        cli.push("--volumes-from".to_string());
        cli.push(source.clone());
    }
    for (key, value) in &request.extra {
        match (key.as_str(), value) {
            ("hostname", serde_yaml::Value::String(hostname)) => {
                cli.push("--hostname".to_string());
                cli.push(hostname.clone());
            }
            ("environment", serde_yaml::Value::Mapping(environment)) => {
                for (variable, value) in environment {
                    let variable = variable.as_str().unwrap_or_default();
                    let value = scalar(value).unwrap_or_default();
                    cli.push("-e".to_string());
                    cli.push(format!("{}={}", variable, value));
                }
            }
            _ => log::warn!("ignoring unsupported creation option {}", key),
        }
    }

    cli.push(request.image.clone());
    if let Some(command) = &request.command {
        cli.extend(command.iter().cloned());
    }
    Ok(cli)
}

fn bind_flag(source: &str, target: &BindTarget) -> String {
    if target.ro {
        format!("{}:{}:ro", source, target.bind)
    } else {
        format!("{}:{}", source, target.bind)
    }
}

/// Maps a `container_port: host_binding` pair to a `-p` argument.  The
/// host side may be a plain port, or a mapping with `HostPort` and an
/// optional `HostIp`; a null binding publishes to an ephemeral port.
fn publish_flag(port: &str, binding: &serde_yaml::Value) -> Result<String> {
    use serde_yaml::Value;

    match binding {
        Value::Null => Ok(port.to_string()),
        Value::Number(host) => Ok(format!("{}:{}", host, port)),
        Value::String(host) => Ok(format!("{}:{}", host, port)),
        Value::Mapping(mapping) => {
            let host_port = mapping
                .get("HostPort")
                .and_then(scalar)
                .ok_or_else(|| invalid_binding(port))?;
            match mapping.get("HostIp").and_then(Value::as_str) {
                Some(ip) => Ok(format!("{}:{}:{}", ip, host_port, port)),
                None => Ok(format!("{}:{}", host_port, port)),
            }
        }
        _ => Err(invalid_binding(port)),
    }
}

fn invalid_binding(port: &str) -> Error {
    Error::InvalidConfiguration(format!("invalid port binding for {}", port))
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(string) => Some(string.clone()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(boolean) => Some(boolean.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerName;

    #[test]
    fn parses_image_list_lines() {
        let record =
            parse_image_line(r#"{"ID":"abc123","Repository":"nginx","Tag":"1.19"}"#).unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.repo_tags, vec!["nginx:1.19"]);

        let dangling =
            parse_image_line(r#"{"ID":"def456","Repository":"<none>","Tag":"<none>"}"#).unwrap();
        assert!(dangling.repo_tags.is_empty());
    }

    #[test]
    fn parses_container_list_lines() {
        let record = parse_container_line(
            r#"{"ID":"c0ffee","Names":"web","State":"running"}"#,
        )
        .unwrap();
        assert_eq!(record.name, ContainerName::new("web"));
        assert!(record.running);

        let stopped =
            parse_container_line(r#"{"ID":"dead","Names":"/db","State":"exited"}"#).unwrap();
        assert_eq!(stopped.name, ContainerName::new("db"));
        assert!(!stopped.running);
    }

    #[test]
    fn publish_flag_covers_the_binding_shapes() {
        use serde_yaml::Value;

        assert_eq!(publish_flag("80/tcp", &Value::Null).unwrap(), "80/tcp");
        assert_eq!(
            publish_flag("80/tcp", &serde_yaml::from_str::<Value>("8080").unwrap()).unwrap(),
            "8080:80/tcp"
        );
        let mapping: Value =
            serde_yaml::from_str("HostIp: 127.0.0.1\nHostPort: 8080\n").unwrap();
        assert_eq!(
            publish_flag("80/tcp", &mapping).unwrap(),
            "127.0.0.1:8080:80/tcp"
        );
        assert!(publish_flag("80/tcp", &serde_yaml::from_str::<Value>("[1]").unwrap()).is_err());
    }

    #[test]
    fn create_args_places_image_and_command_last() {
        let mut request = CreateRequest {
            name: Some(ContainerName::new("web")),
            image: "nginx:latest".to_string(),
            command: Some(vec!["nginx".to_string(), "-g".to_string()]),
            ..CreateRequest::default()
        };
        request.binds.insert(
            "/srv".to_string(),
            BindTarget {
                bind: "/data".to_string(),
                ro: true,
            },
        );
        let cli = create_args(&request).unwrap();
        assert_eq!(cli[0], "create");
        assert!(cli.contains(&"--name".to_string()));
        assert!(cli.contains(&"/srv:/data:ro".to_string()));
        let image_at = cli.iter().position(|a| a == "nginx:latest").unwrap();
        assert_eq!(&cli[image_at + 1..], ["nginx", "-g"]);
    }
}
