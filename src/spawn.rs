//! Host-side process spawning with line-wise output delivery.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use crate::errors::{Error, Result};

/// Runs a local process and returns its exit code.
///
/// Stdout is delivered to `out_handler` line by line as it arrives; stderr
/// is drained on a helper thread and delivered to `err_handler` once the
/// process has exited.  Every line written by the child reaches its handler
/// before this function returns.
pub fn spawn_process<O, E>(
    args: &[String],
    shell: bool,
    cwd: Option<&Path>,
    mut out_handler: O,
    mut err_handler: E,
) -> Result<i32>
where
    O: FnMut(&str),
    E: FnMut(&str),
{
    if args.is_empty() {
        return Err(Error::InvalidConfiguration(
            "cannot execute an empty command".to_string(),
        ));
    }

    let mut command = if shell {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(args.join(" "));
        command
    } else {
        let mut command = Command::new(&args[0]);
        command.args(&args[1..]);
        command
    };

    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().ok_or_else(|| {
        Error::ExecutionFailed {
            command: args.to_vec(),
            code: -1,
            cwd: display_cwd(cwd),
        }
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        Error::ExecutionFailed {
            command: args.to_vec(),
            code: -1,
            cwd: display_cwd(cwd),
        }
    })?;

    // Drain stderr on a helper thread so neither pipe can fill up and block
    // the child; the collected lines are handed over after the join, which
    // keeps the handler free of a Send bound.
    let stderr_thread = thread::spawn(move || {
        BufReader::new(stderr)
            .lines()
            .filter_map(|line| line.ok())
            .collect::<Vec<String>>()
    });

    for line in BufReader::new(stdout).lines() {
        out_handler(&line?);
    }

    let status = child.wait()?;
    for line in stderr_thread.join().unwrap_or_default() {
        err_handler(&line);
    }

    Ok(status.code().unwrap_or(-1))
}

fn display_cwd(cwd: Option<&Path>) -> String {
    cwd.map(|path| path.display().to_string())
        .unwrap_or_else(|| ".".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn delivers_stdout_lines() {
        let mut out = Vec::new();
        let code = spawn_process(
            &args(&["echo", "hello world"]),
            false,
            None,
            |line| out.push(line.to_string()),
            |_| {},
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, vec!["hello world"]);
    }

    #[test]
    fn delivers_stderr_lines_before_returning() {
        let mut err = Vec::new();
        let code = spawn_process(
            &args(&["sh", "-c", "echo oops 1>&2"]),
            false,
            None,
            |_| {},
            |line| err.push(line.to_string()),
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(err, vec!["oops"]);
    }

    #[test]
    fn reports_the_exit_code() {
        let code = spawn_process(&args(&["sh", "-c", "exit 3"]), false, None, |_| {}, |_| {})
            .unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn shell_mode_joins_the_command_line() {
        let mut out = Vec::new();
        let code = spawn_process(
            &args(&["echo", "a", "&&", "echo", "b"]),
            true,
            None,
            |line| out.push(line.to_string()),
            |_| {},
        )
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, vec!["a", "b"]);
    }

    #[test]
    fn empty_commands_are_rejected() {
        assert!(spawn_process(&[], false, None, |_| {}, |_| {}).is_err());
    }
}
