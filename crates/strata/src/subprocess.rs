// SPDX-FileCopyrightText: Copyright © 2024-2025 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Subprocess management for postinstall programs.
//!
//! An explicit collaborator rather than a process-wide singleton: the
//! performer receives one at construction. Children are reaped on every
//! exit path; a [`ChildGuard`] kills and waits on drop so an engine error
//! can never leak a running helper.

use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

/// How often a running child is polled for exit
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct Subprocess {}

impl Subprocess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `program` with `args`, blocking until it exits or the timeout
    /// lapses. The child is killed and reaped on timeout.
    pub fn exec(&self, program: &Path, args: &[&str], timeout: Duration) -> Result<ExitStatus, Error> {
        info!("running {program:?} {args:?}");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.into(),
                source,
            })?;

        let mut guard = ChildGuard(Some(child));
        let deadline = Instant::now() + timeout;

        loop {
            let child = guard.0.as_mut().expect("child not yet reaped");

            match child.try_wait().map_err(Error::Wait)? {
                Some(status) => {
                    guard.0 = None;
                    return Ok(status);
                }
                None if Instant::now() >= deadline => {
                    drop(guard);
                    return Err(Error::Timeout {
                        program: program.into(),
                        timeout,
                    });
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

/// Kills and reaps the wrapped child when dropped
struct ChildGuard(Option<Child>);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            if let Err(error) = child.kill() {
                warn!("failed to kill child: {error}");
            }
            let _ = child.wait();
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("spawning {program:?}")]
    Spawn {
        program: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("waiting on child")]
    Wait(#[source] std::io::Error),
    #[error("{program:?} exceeded {timeout:?}")]
    Timeout {
        program: std::path::PathBuf,
        timeout: Duration,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exec_captures_exit_status() {
        let subprocess = Subprocess::new();

        let status = subprocess
            .exec(Path::new("/bin/sh"), &["-c", "exit 0"], Duration::from_secs(5))
            .unwrap();
        assert!(status.success());

        let status = subprocess
            .exec(Path::new("/bin/sh"), &["-c", "exit 3"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn timeout_kills_the_child() {
        let subprocess = Subprocess::new();

        let error = subprocess
            .exec(Path::new("/bin/sh"), &["-c", "sleep 30"], Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let subprocess = Subprocess::new();

        let error = subprocess
            .exec(Path::new("/no/such/binary"), &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(error, Error::Spawn { .. }));
    }
}
