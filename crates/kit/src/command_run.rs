//! Helpers for driving the external tools this crate shells out to
//! (`qemu-img`, `ip`, `ovs-vsctl`, `sshpass`).

use std::io::{Read, Seek};
use std::process::Command;

use crate::errors::{Error, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, returning an error carrying the trailing
    /// stderr if it exits abnormally.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and report whether it exited successfully,
    /// logging rather than propagating a failure status. Used for existence
    /// probes where a non-zero exit is an answer, not an error.
    fn run_check(&mut self) -> Result<bool>;

    /// Execute the child process and capture its stdout. Uses `run`
    /// internally and fails if the child exits abnormally.
    fn run_get_output(&mut self) -> Result<Box<dyn std::io::BufRead>>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals failure, return an error carrying the
    /// trailing stderr. The command string is intentionally left to the
    /// caller; it may be verbose.
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()>;
}

impl ExitStatusExt for std::process::ExitStatus {
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        Err(Error::Subprocess {
            status: format!("{self}"),
            stderr: last_utf8_content_from_file(stderr),
        })
    }
}

/// Read the trailing bytes of a capture file, bounded so pathological tool
/// output cannot balloon an error message.
pub(crate) fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        self.status()?.check_status(stderr)
    }

    fn run_check(&mut self) -> Result<bool> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdout(std::process::Stdio::null());
        tracing::trace!("exec (probe): {self:?}");
        let status = self.status()?;
        if !status.success() {
            tracing::trace!("probe exited {status}: {}", last_utf8_content_from_file(stderr));
        }
        Ok(status.success())
    }

    fn run_get_output(&mut self) -> Result<Box<dyn std::io::BufRead>> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0))?;
        Ok(Box::new(std::io::BufReader::new(stdout)))
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut s = String::new();
        let mut o = self.run_get_output()?;
        o.read_to_string(&mut s)?;
        Ok(s)
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let output = self.run_get_output()?;
        serde_json::from_reader(output).map_err(Into::into)
    }
}
