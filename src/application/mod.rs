use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

/// Desired state of an application, as persisted ("start" / "stop").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Start,
    Stop,
}

impl DesiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            other => Err(anyhow::anyhow!("unknown status '{}'", other)),
        }
    }
}

/// 관리 대상 애플리케이션 - 설정 저장소가 소유
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    #[serde(rename = "executable")]
    pub executable_path: PathBuf,
    pub status: DesiredStatus,
}

impl ApplicationSpec {
    pub fn new(name: &str, executable_path: impl Into<PathBuf>, status: DesiredStatus) -> Self {
        Self {
            name: name.to_string(),
            executable_path: executable_path.into(),
            status,
        }
    }
}

/// The configuration store as seen by the supervisor.
pub trait ApplicationSource: Send + Sync {
    /// Ordered desired-state snapshot.
    fn applications(&self) -> Vec<ApplicationSpec>;

    /// Best-effort persistence of a status change. `false` on unknown name or I/O failure.
    fn update_status(&self, name: &str, status: DesiredStatus) -> bool;
}

/// On-disk shape; every field optional so one bad entry doesn't reject the file.
#[derive(Debug, Deserialize)]
struct RawApplication {
    #[serde(default)]
    name: String,
    #[serde(default)]
    executable: String,
    #[serde(default)]
    status: String,
}

struct StoreState {
    applications: Vec<ApplicationSpec>,
    loaded_at: Option<SystemTime>,
}

/// 애플리케이션 저장소 - applications.json 관리
///
/// Reloads the file whenever its modification time changes, so edits made by
/// other tools show up at the next reconciliation cycle.
pub struct JsonApplicationStore {
    file_path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonApplicationStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            state: Mutex::new(StoreState {
                applications: Vec::new(),
                loaded_at: None,
            }),
        }
    }

    /// Create the store and load it from disk.
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(file_path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // plain data, a panicked writer cannot leave it half-updated in a way that matters
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 파일에서 애플리케이션 목록 로드
    pub fn load(&self) -> Result<()> {
        let mut state = self.lock();
        self.load_into(&mut state)
    }

    fn load_into(&self, state: &mut StoreState) -> Result<()> {
        if !self.file_path.exists() {
            tracing::info!(
                "Application store {} does not exist, starting empty",
                self.file_path.display()
            );
            state.applications = Vec::new();
            state.loaded_at = None;
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)?;
        let raw: Vec<RawApplication> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&content)?
        };
        state.applications = validate(raw);
        state.loaded_at = modified_time(&self.file_path);
        tracing::info!("Loaded {} applications", state.applications.len());
        Ok(())
    }

    /// 파일에 저장
    pub fn save(&self) -> Result<()> {
        let mut state = self.lock();
        self.save_from(&mut state)
    }

    fn save_from(&self, state: &mut StoreState) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&state.applications)?;
        fs::write(&self.file_path, content)?;
        state.loaded_at = modified_time(&self.file_path);
        tracing::debug!("Saved {} applications", state.applications.len());
        Ok(())
    }

    /// 애플리케이션 추가 (이름 중복 불가)
    pub fn add(&self, spec: ApplicationSpec) -> Result<()> {
        let mut state = self.lock();
        self.reload_if_changed(&mut state);
        if state.applications.iter().any(|a| a.name == spec.name) {
            return Err(anyhow::anyhow!("Application '{}' already exists", spec.name));
        }
        state.applications.push(spec);
        self.save_from(&mut state)
    }

    /// 애플리케이션 제거
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        self.reload_if_changed(&mut state);
        let before = state.applications.len();
        state.applications.retain(|a| a.name != name);
        if state.applications.len() == before {
            return Err(anyhow::anyhow!("Application not found: {}", name));
        }
        self.save_from(&mut state)
    }

    pub fn get(&self, name: &str) -> Option<ApplicationSpec> {
        self.lock().applications.iter().find(|a| a.name == name).cloned()
    }

    fn reload_if_changed(&self, state: &mut StoreState) {
        let current = modified_time(&self.file_path);
        if current.is_none() || current == state.loaded_at {
            return;
        }
        tracing::info!("{} changed on disk, reloading", self.file_path.display());
        if let Err(e) = self.load_into(state) {
            tracing::warn!("Failed to reload {}: {}, keeping previous list", self.file_path.display(), e);
            // don't retry the same broken file every cycle
            state.loaded_at = current;
        }
    }
}

impl ApplicationSource for JsonApplicationStore {
    fn applications(&self) -> Vec<ApplicationSpec> {
        let mut state = self.lock();
        self.reload_if_changed(&mut state);
        state.applications.clone()
    }

    fn update_status(&self, name: &str, status: DesiredStatus) -> bool {
        let mut state = self.lock();
        // 디스크에서 바뀐 내용을 덮어쓰지 않도록 먼저 다시 읽음
        self.reload_if_changed(&mut state);
        let Some(app) = state.applications.iter_mut().find(|a| a.name == name) else {
            tracing::warn!("Cannot update status, application not found: {}", name);
            return false;
        };
        app.status = status;
        tracing::info!("App status updated - {}: {}", name, status);
        match self.save_from(&mut state) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to persist status of '{}': {}", name, e);
                false
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn validate(raw: Vec<RawApplication>) -> Vec<ApplicationSpec> {
    let mut seen = HashSet::new();
    let mut applications = Vec::with_capacity(raw.len());

    for entry in raw {
        let name = entry.name.trim();
        let executable = entry.executable.trim();
        if name.is_empty() || executable.is_empty() {
            tracing::warn!("Skipping application entry without name or executable");
            continue;
        }
        let status = match entry.status.parse::<DesiredStatus>() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Skipping application '{}': {}", name, e);
                continue;
            }
        };
        if !seen.insert(name.to_string()) {
            tracing::warn!("Duplicate application '{}', keeping the first entry", name);
            continue;
        }
        applications.push(ApplicationSpec::new(name, executable, status));
    }
    applications
}
