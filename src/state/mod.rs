// State module - Registered applications persisted across daemon restarts

use crate::config::ApplicationSpec;
use crate::error::{Result, ShepherdError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Version of the state file format
const STATE_VERSION: &str = "1";

/// One registered application as it was when the daemon last shut down
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedApp {
    pub spec: ApplicationSpec,
    /// Descriptor the application was loaded from
    pub source: Option<PathBuf>,
    /// Whether it had live instances; only these are started again
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub version: String,
    pub apps: Vec<PersistedApp>,
    pub last_updated: SystemTime,
}

impl DaemonState {
    pub fn new(apps: Vec<PersistedApp>) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            apps,
            last_updated: SystemTime::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(ShepherdError::State(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        let mut seen = HashSet::new();
        for app in &self.apps {
            if !seen.insert(app.spec.name.as_str()) {
                return Err(ShepherdError::State(format!(
                    "Duplicate application name found: {}",
                    app.spec.name
                )));
            }
        }

        Ok(())
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// JSON file holding the daemon state, replaced atomically on save
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the saved state; a missing file is an empty state
    pub fn load(&self) -> Result<DaemonState> {
        if !self.path.exists() {
            return Ok(DaemonState::default());
        }

        let file = File::open(&self.path)
            .map_err(|e| ShepherdError::State(format!("Failed to open state file: {}", e)))?;

        let state: DaemonState = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ShepherdError::State(format!("Failed to parse state file: {}", e)))?;

        state.validate()?;
        Ok(state)
    }

    /// Write to a sibling temp file, then rename over the real one
    pub fn save(&self, state: &DaemonState) -> Result<()> {
        state.validate()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ShepherdError::State(format!("Failed to create state directory: {}", e))
            })?;
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path).map_err(|e| {
                ShepherdError::State(format!("Failed to create temp state file: {}", e))
            })?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, state).map_err(|e| {
                ShepherdError::Serialization(format!("Failed to serialize state: {}", e))
            })?;
            writer
                .flush()
                .map_err(|e| ShepherdError::State(format!("Failed to flush state file: {}", e)))?;
        }

        fs::rename(&temp_path, &self.path).map_err(|e| {
            ShepherdError::State(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
