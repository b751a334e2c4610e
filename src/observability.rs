use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::Settings;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn configure_tracing(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub frames_submitted: u64,
    pub inputs_released: u64,
    pub frames_output: u64,
    pub frames_decoded: u64,
    pub frames_discarded: u64,
    pub frames_encoded: u64,
    pub errors: u64,
}

/// Per-session counters, shared between the host thread, the submit worker
/// and hardware callback threads.
#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    inner: Arc<Mutex<SessionSnapshot>>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, apply: impl FnOnce(&mut SessionSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }

    pub fn record_submitted(&self) {
        self.update(|s| s.frames_submitted += 1);
    }

    pub fn record_input_released(&self) {
        self.update(|s| s.inputs_released += 1);
    }

    /// A frame came out of the hardware, whatever happens to it next.
    pub fn record_output(&self) {
        self.update(|s| s.frames_output += 1);
    }

    pub fn record_decoded(&self) {
        self.update(|s| s.frames_decoded += 1);
    }

    pub fn record_discarded(&self) {
        self.update(|s| s.frames_discarded += 1);
    }

    pub fn record_encoded(&self) {
        self.update(|s| s.frames_encoded += 1);
    }

    pub fn record_error(&self) {
        self.update(|s| s.errors += 1);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub fn log_snapshot(snapshot: &SessionSnapshot) {
    info!(
        submitted = snapshot.frames_submitted,
        released = snapshot.inputs_released,
        output = snapshot.frames_output,
        decoded = snapshot.frames_decoded,
        discarded = snapshot.frames_discarded,
        encoded = snapshot.frames_encoded,
        errors = snapshot.errors,
        "Session metrics summary"
    );
}
