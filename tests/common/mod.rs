// tests/common/mod.rs

//! Shared fixtures for integration tests

#![allow(dead_code)]

#[path = "../../src/package/testutil.rs"]
mod zip;

pub use zip::{ZipBuilder, padding_extra};

use ota_updater::engine::{ApplyRequest, EngineEvent, UpdateEngine};
use ota_updater::notify::Notifier;
use ota_updater::package::SignatureCheck;
use ota_updater::power::WakeLock;
use ota_updater::transfer::{Fetcher, UpdateMetadata};
use ota_updater::{Error, Result, TransferFailure};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

pub const PAYLOAD: &[u8] = b"CrAU\x00\x00\x00\x00\x00\x00\x00\x02payload-body";
pub const PROPERTIES: &[u8] =
    b"FILE_HASH=lURPCIkIAjtMOyB/EjQcl8zDzqtD6Ta3tJef6G/+z7k=\nFILE_SIZE=24\n";

/// A typical A/B package whose metadata declares `post_timestamp`
pub fn package(post_timestamp: i64) -> Vec<u8> {
    let metadata = format!(
        "ota-required-cache=0\nota-type=AB\npost-build-incremental=target123\n\
         post-timestamp={}\n",
        post_timestamp
    );
    ZipBuilder::new()
        .dir("META-INF/")
        .deflated("META-INF/com/android/metadata", metadata.as_bytes())
        .stored_with_extra("care_map.pb", b"care map", padding_extra(8))
        .stored("payload.bin", PAYLOAD)
        .stored("payload_properties.txt", PROPERTIES)
        .build()
}

/// Byte offset of `PAYLOAD` inside `bytes`
pub fn find_payload(bytes: &[u8]) -> u64 {
    bytes
        .windows(PAYLOAD.len())
        .position(|w| w == PAYLOAD)
        .unwrap() as u64
}

/// Serves canned responses and records every requested path
#[derive(Clone, Default)]
pub struct StubFetcher {
    responses: Arc<HashMap<String, std::result::Result<Vec<u8>, TransferFailure>>>,
    calls: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Gate>>,
}

/// Holds the first metadata fetch until released
pub struct Gate {
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(mut self, path: &str, bytes: Vec<u8>) -> Self {
        Arc::make_mut(&mut self.responses).insert(path.to_string(), Ok(bytes));
        self
    }

    pub fn fail(mut self, path: &str, kind: TransferFailure) -> Self {
        Arc::make_mut(&mut self.responses).insert(path.to_string(), Err(kind));
        self
    }

    pub fn gated(mut self, entered: Sender<()>, release: Receiver<()>) -> Self {
        self.gate = Some(Arc::new(Gate {
            entered: Mutex::new(entered),
            release: Mutex::new(release),
        }));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls().iter().filter(|p| *p == path).count()
    }
}

impl Fetcher for StubFetcher {
    fn fetch(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.calls.lock().unwrap().push(path.to_string());

        if let Some(gate) = &self.gate {
            if !path.ends_with(".zip") {
                gate.entered.lock().unwrap().send(()).unwrap();
                gate.release.lock().unwrap().recv().unwrap();
            }
        }

        match self.responses.get(path) {
            Some(Ok(bytes)) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Some(Err(kind)) => Err(Error::transfer(path, kind.clone())),
            None => Err(Error::transfer(path, TransferFailure::NotFound)),
        }
    }

    fn describe(&self, path: &str) -> String {
        format!("stub://{}", path)
    }
}

/// Accepts every signature
pub struct TrustAll;

impl SignatureCheck for TrustAll {
    fn verify_package(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Completes every submission with a fixed code from another thread
#[derive(Clone)]
pub struct StubEngine {
    code: i32,
    pub requests: Arc<Mutex<Vec<ApplyRequest>>>,
}

impl StubEngine {
    pub fn completing_with(code: i32) -> Self {
        Self {
            code,
            requests: Arc::default(),
        }
    }
}

impl UpdateEngine for StubEngine {
    fn apply_payload(&self, request: ApplyRequest, events: Sender<EngineEvent>) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        let code = self.code;
        thread::spawn(move || {
            for fraction in [0.25, 0.5, 1.0] {
                let _ = events.send(EngineEvent::StatusUpdate { code: 3, fraction });
            }
            let _ = events.send(EngineEvent::Complete { error_code: code });
        });
        Ok(())
    }
}

/// Records reboot notifications
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub notified: Arc<Mutex<Vec<UpdateMetadata>>>,
}

impl Notifier for RecordingNotifier {
    fn reboot_required(&self, metadata: &UpdateMetadata) -> Result<()> {
        self.notified.lock().unwrap().push(metadata.clone());
        Ok(())
    }
}

/// Counts wake lock acquisitions and releases
#[derive(Clone, Default)]
pub struct CountingWakeLock {
    pub acquired: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl CountingWakeLock {
    pub fn held(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self, _tag: &str) -> Result<()> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, _tag: &str) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
