// src/engine.rs

//! Update engine client
//!
//! The engine that writes payloads to partitions runs as a separate,
//! privileged service. A payload is submitted once and the engine reports
//! back asynchronously: any number of status updates followed by exactly one
//! completion code. Those reports arrive on an mpsc channel from the
//! engine's own thread.

use crate::error::{Error, Result};
use crate::transfer::remove_package;
use std::ffi::OsString;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;
use tracing::{debug, info, warn};

/// Completion code for a successfully applied payload
pub const SUCCESS: i32 = 0;

/// Generic failure code
pub const ERROR: i32 = 1;

/// Default engine front-end program
pub const DEFAULT_ENGINE_PROGRAM: &str = "update_engine_client";

/// Report from the update engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Progress report; not terminal
    StatusUpdate { code: i32, fraction: f32 },
    /// Terminal report, sent exactly once per submission
    Complete { error_code: i32 },
}

/// A payload submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    /// `file://` URL of the package holding the payload
    pub payload_url: String,
    /// Byte offset of the payload inside the package
    pub offset: u64,
    /// Payload length, 0 lets the engine work it out
    pub size: u64,
    /// Lines of `payload_properties.txt`
    pub properties: Vec<String>,
}

/// The privileged engine that applies payloads
pub trait UpdateEngine: Send + Sync {
    /// Submit a payload without waiting for it to be applied
    ///
    /// Every submission that returns `Ok` must eventually send one
    /// `EngineEvent::Complete` on `events`, or drop the sender.
    fn apply_payload(&self, request: ApplyRequest, events: Sender<EngineEvent>) -> Result<()>;
}

/// Name of an engine status code
pub fn status_name(code: i32) -> &'static str {
    match code {
        0 => "IDLE",
        1 => "CHECKING_FOR_UPDATE",
        2 => "UPDATE_AVAILABLE",
        3 => "DOWNLOADING",
        4 => "VERIFYING",
        5 => "FINALIZING",
        6 => "UPDATED_NEED_REBOOT",
        7 => "REPORTING_ERROR_EVENT",
        8 => "ATTEMPTING_ROLLBACK",
        9 => "DISABLED",
        _ => "UNKNOWN",
    }
}

/// Name of an engine completion code
pub fn error_name(code: i32) -> &'static str {
    match code {
        0 => "SUCCESS",
        1 => "ERROR",
        4 => "FILESYSTEM_COPIER_ERROR",
        5 => "POST_INSTALL_RUNNER_ERROR",
        6 => "PAYLOAD_MISMATCHED_TYPE_ERROR",
        7 => "INSTALL_DEVICE_OPEN_ERROR",
        8 => "KERNEL_DEVICE_OPEN_ERROR",
        9 => "DOWNLOAD_TRANSFER_ERROR",
        10 => "PAYLOAD_HASH_MISMATCH_ERROR",
        11 => "PAYLOAD_SIZE_MISMATCH_ERROR",
        12 => "DOWNLOAD_PAYLOAD_VERIFICATION_ERROR",
        51 => "PAYLOAD_TIMESTAMP_ERROR",
        52 => "UPDATED_BUT_NOT_ACTIVE",
        _ => "UNKNOWN",
    }
}

/// Map a completion code onto the run result
pub fn completion_result(error_code: i32) -> Result<()> {
    if error_code == SUCCESS {
        Ok(())
    } else {
        Err(Error::Apply(error_code))
    }
}

/// Submits payloads and waits for the engine's completion report
pub struct UpdateEngineClient {
    engine: Box<dyn UpdateEngine>,
}

impl UpdateEngineClient {
    pub fn new(engine: Box<dyn UpdateEngine>) -> Self {
        Self { engine }
    }

    /// Apply the payload at `offset` inside the package at `path`
    ///
    /// Blocks until the engine reports completion. The package file is
    /// deleted as soon as completion is observed, whatever the outcome.
    pub fn apply(&self, path: &Path, offset: u64, size: u64, properties: &[String]) -> Result<()> {
        let request = ApplyRequest {
            payload_url: format!("file://{}", path.display()),
            offset,
            size,
            properties: properties.to_vec(),
        };
        info!(
            "Submitting {} at offset {} to update engine",
            request.payload_url, offset
        );

        let (tx, rx) = mpsc::channel();
        self.engine.apply_payload(request, tx)?;

        let mut last_status = None;
        loop {
            match rx.recv() {
                Ok(EngineEvent::StatusUpdate { code, fraction }) => {
                    if last_status != Some(code) {
                        info!("Update engine status {}", status_name(code));
                        last_status = Some(code);
                    }
                    debug!("onStatusUpdate: {} ({}), {:.3}", status_name(code), code, fraction);
                }
                Ok(EngineEvent::Complete { error_code }) => {
                    info!(
                        "Update engine finished: {} ({})",
                        error_name(error_code),
                        error_code
                    );
                    remove_package(path);
                    return completion_result(error_code);
                }
                Err(_) => return Err(Error::EngineDisconnected),
            }
        }
    }
}

/// Drives the engine through its command-line front end
///
/// Runs `<program> [args] --update --follow --payload=<url> --offset=<o>
/// --size=<s> --headers=<properties>` and reports the exit status as the
/// completion code. Status lines printed while following are forwarded as
/// status updates.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Arguments placed before the update flags
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl UpdateEngine for CommandEngine {
    fn apply_payload(&self, request: ApplyRequest, events: Sender<EngineEvent>) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--update")
            .arg("--follow")
            .arg(format!("--payload={}", request.payload_url))
            .arg(format!("--offset={}", request.offset))
            .arg(format!("--size={}", request.size))
            .arg(format!("--headers={}", request.properties.join("\n")))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::InitError(format!(
                    "Failed to start update engine {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        // The child stays here until a follower thread exists to own it
        let (handoff, pickup) = mpsc::channel::<Child>();
        let spawned = thread::Builder::new()
            .name("update-engine".to_string())
            .spawn(move || {
                if let Ok(child) = pickup.recv() {
                    follow(child, &events);
                }
            });

        let failure = match spawned {
            Ok(_) => match handoff.send(child) {
                Ok(()) => return Ok(()),
                Err(mpsc::SendError(returned)) => {
                    child = returned;
                    "follower thread exited early".to_string()
                }
            },
            Err(e) => e.to_string(),
        };

        abandon(&mut child);
        Err(Error::InitError(format!(
            "Failed to follow update engine {}: {}",
            self.program.display(),
            failure
        )))
    }
}

/// Relay status lines until the engine exits, then report its exit code
fn follow(mut child: Child, events: &Sender<EngineEvent>) {
    if let Some(stdout) = child.stdout.take() {
        for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
            match parse_status_line(&line) {
                Some(event) => {
                    let _ = events.send(event);
                }
                None => debug!("update engine: {}", line),
            }
        }
    }

    let error_code = match child.wait() {
        Ok(status) => status.code().unwrap_or(ERROR),
        Err(e) => {
            warn!("Failed to wait for update engine: {}", e);
            ERROR
        }
    };
    let _ = events.send(EngineEvent::Complete { error_code });
}

/// Kill and reap an engine process nobody will follow
fn abandon(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill update engine {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap update engine {}: {}", child.id(), e);
    }
}

/// Parse `onStatusUpdate(<NAME> (<code>), <fraction>)`
fn parse_status_line(line: &str) -> Option<EngineEvent> {
    let rest = &line[line.find("onStatusUpdate(")? + "onStatusUpdate(".len()..];
    let open = rest.find(" (")?;
    let close = rest[open..].find("),")? + open;
    let code = rest[open + 2..close].trim().parse().ok()?;
    let fraction = rest[close + 2..].trim().trim_end_matches(')').trim().parse().ok()?;
    Some(EngineEvent::StatusUpdate { code, fraction })
}
