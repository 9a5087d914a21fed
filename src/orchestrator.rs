// src/orchestrator.rs

//! Update run orchestration
//!
//! An `Orchestrator` owns the run state and drives one update run through
//! metadata, download, verification, payload location and apply. Only one
//! run may be in flight; callers arriving while a run is active get
//! `RunOutcome::AlreadyRunning` straight back.

use crate::db::Journal;
use crate::db::models::{Outcome, RunRecord};
use crate::device::DeviceProperties;
use crate::engine::UpdateEngineClient;
use crate::error::Result;
use crate::notify::{LogNotifier, Notifier};
use crate::package::{Verifier, locate};
use crate::power::{NoWakeLock, WakeLease, WakeLock};
use crate::schedule::Scheduler;
use crate::transfer::{TransferManager, UpdateMetadata, is_newer, remove_package};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Tag used for the wake lock held during a run
pub const WAKE_LOCK_TAG: &str = "ota-updater";

/// Where the orchestrator is in the update lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Downloading,
    Verifying,
    Applying,
    /// Terminal for the life of the process
    AwaitingReboot,
}

/// Step of a run, reported with failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Download,
    Verify,
    Locate,
    Apply,
}

impl Stage {
    pub fn as_str(&self) -> &str {
        match self {
            Stage::Metadata => "metadata",
            Stage::Download => "download",
            Stage::Verify => "verify",
            Stage::Locate => "locate",
            Stage::Apply => "apply",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a call to `Orchestrator::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was in flight, or the device already awaits a reboot
    AlreadyRunning,
    /// The server offered nothing newer than the installed build
    UpToDate,
    /// The build was applied and the device needs a reboot
    RebootRequired(UpdateMetadata),
}

/// Single-flight guard over the run state
///
/// Entering moves `Idle` to `Downloading`. Dropping the guard puts the state
/// back to `Idle` unless the run finished successfully.
struct RunGuard<'a> {
    state: &'a Mutex<RunState>,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn enter(state: &'a Mutex<RunState>) -> Option<Self> {
        let mut current = lock_state(state);
        if *current != RunState::Idle {
            return None;
        }
        *current = RunState::Downloading;

        Some(Self {
            state,
            finished: false,
        })
    }

    fn advance(&self, next: RunState) {
        *lock_state(self.state) = next;
    }

    fn finish(mut self) {
        self.advance(RunState::AwaitingReboot);
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *lock_state(self.state) = RunState::Idle;
        }
    }
}

fn lock_state(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drives update runs for one device
pub struct Orchestrator {
    state: Mutex<RunState>,
    device: DeviceProperties,
    transfer: TransferManager,
    verifier: Verifier,
    engine: UpdateEngineClient,
    wake_lock: Box<dyn WakeLock>,
    notifier: Box<dyn Notifier>,
    scheduler: Option<Box<dyn Scheduler>>,
    journal: Option<Journal>,
}

impl Orchestrator {
    pub fn new(
        device: DeviceProperties,
        transfer: TransferManager,
        verifier: Verifier,
        engine: UpdateEngineClient,
    ) -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
            device,
            transfer,
            verifier,
            engine,
            wake_lock: Box::new(NoWakeLock),
            notifier: Box::new(LogNotifier),
            scheduler: None,
            journal: None,
        }
    }

    pub fn with_wake_lock(mut self, wake_lock: Box<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Scheduler to cancel once an update has been applied
    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn state(&self) -> RunState {
        *lock_state(&self.state)
    }

    pub fn device(&self) -> &DeviceProperties {
        &self.device
    }

    /// Perform one update run
    ///
    /// Returns `AlreadyRunning` without side effects when the state is not
    /// `Idle`. A failed run is logged with its stage, its package is
    /// deleted, the state returns to `Idle` and the error is handed back.
    pub fn run(&self) -> Result<RunOutcome> {
        let Some(guard) = RunGuard::enter(&self.state) else {
            info!("Update run already in progress, skipping");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let _lease = WakeLease::acquire(self.wake_lock.as_ref(), WAKE_LOCK_TAG);

        let mut record = RunRecord::begin();
        let mut stage = Stage::Metadata;

        let result = self.execute(&guard, &mut stage, &mut record);
        let outcome = match result {
            Ok(Some(metadata)) => {
                guard.finish();
                self.on_success(&metadata);
                record.finish(stage.as_str(), Outcome::RebootRequired, None);
                Ok(RunOutcome::RebootRequired(metadata))
            }
            Ok(None) => {
                drop(guard);
                record.finish(stage.as_str(), Outcome::UpToDate, None);
                Ok(RunOutcome::UpToDate)
            }
            Err(e) => {
                error!("Update run failed during {}: {}", stage, e);
                remove_package(self.transfer.package_path());
                drop(guard);
                record.finish(stage.as_str(), Outcome::Failed, Some(e.to_string()));
                Err(e)
            }
        };

        self.journal_run(&mut record);
        outcome
    }

    /// The run proper; `Ok(None)` means the device is up to date
    fn execute(
        &self,
        guard: &RunGuard<'_>,
        stage: &mut Stage,
        record: &mut RunRecord,
    ) -> Result<Option<UpdateMetadata>> {
        let installed = &self.device.build;

        *stage = Stage::Metadata;
        let metadata = self.transfer.fetch_metadata(&self.device.device_id)?;
        record.target_incremental = Some(metadata.target_incremental_id.clone());
        record.build_timestamp = Some(metadata.build_timestamp);

        if !is_newer(&metadata, installed) {
            info!(
                "Installed build {} ({}) is current",
                installed.incremental_id, installed.timestamp_utc
            );
            return Ok(None);
        }

        *stage = Stage::Download;
        let handle = self.transfer.fetch_package(
            &self.device.device_id,
            &installed.incremental_id,
            &metadata.target_incremental_id,
        )?;
        record.package_sha256 = handle.sha256().map(str::to_string);

        guard.advance(RunState::Verifying);
        *stage = Stage::Verify;
        self.verifier.verify(&handle, metadata.build_timestamp)?;

        *stage = Stage::Locate;
        let layout = locate(&handle)?;

        guard.advance(RunState::Applying);
        *stage = Stage::Apply;
        // Size 0 lets the engine read to the end of the payload itself
        self.engine.apply(
            handle.path(),
            layout.payload_offset,
            0,
            &layout.payload_properties,
        )?;

        info!("Build {} applied", metadata.target_incremental_id);
        Ok(Some(metadata))
    }

    fn on_success(&self, metadata: &UpdateMetadata) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel();
        }
        if let Err(e) = self.notifier.reboot_required(metadata) {
            warn!("Failed to raise reboot notification: {}", e);
        }
    }

    fn journal_run(&self, record: &mut RunRecord) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.record(record) {
            warn!("Failed to journal update run: {}", e);
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
