// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use fs_err as fs;
use gate_types::{Baseline, Registration, VerificationResult};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::GateError;

const BASELINES_FILE: &str = "baselines.json";
const HISTORY_FILE: &str = "history.jsonl";

/// Narrow repository the verification core reads registrations from and writes
/// baselines and history to.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn registration(&self, id: &str) -> Option<Registration>;

    async fn set_baseline(&self, id: &str, baseline: Baseline) -> Result<(), GateError>;

    async fn append_history(&self, result: VerificationResult) -> Result<(), GateError>;

    /// Newest first.
    async fn history(
        &self,
        registration_id: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Vec<VerificationResult>;
}

/// Registrations from a JSON file, with captured baselines and history kept in
/// memory and optionally mirrored to a state directory.
pub struct FileStore {
    registrations: RwLock<BTreeMap<String, Registration>>,
    history: Mutex<HistoryLog>,
    history_limit: usize,
    state_dir: Option<PathBuf>,
}

#[derive(Default)]
struct HistoryLog {
    entries: VecDeque<VerificationResult>,
    /// Lines in the history file, retained or not.
    disk_lines: usize,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("state writer task failed")?
}

fn write_atomically(dir: &Path, file_name: &str, content: &[u8]) -> Result<()> {
    fs::create_dir_all(dir).context("failed to create state directory")?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).context("failed to create temporary state file")?;
    tmp.write_all(content).context("failed to write state file")?;
    tmp.as_file_mut()
        .sync_all()
        .context("failed to flush state file")?;
    let path = dir.join(file_name);
    tmp.persist(&path)
        .map_err(|e| anyhow!("failed to persist {}: {e}", path.display()))?;
    Ok(())
}

fn append_line(dir: &Path, file_name: &str, line: &[u8]) -> Result<()> {
    fs::create_dir_all(dir).context("failed to create state directory")?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file_name))?;
    file.write_all(line)?;
    Ok(())
}

/// Oldest first, one JSON document per line.
fn history_lines(entries: &VecDeque<VerificationResult>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for result in entries.iter().rev() {
        serde_json::to_writer(&mut out, result).context("failed to serialize history")?;
        out.push(b'\n');
    }
    Ok(out)
}

fn load_history(path: &Path, limit: usize) -> Result<HistoryLog> {
    let mut log = HistoryLog::default();
    if !path.exists() {
        return Ok(log);
    }
    let reader = BufReader::new(fs::File::open(path)?);
    for line in reader.lines() {
        let line = line.context("failed to read history")?;
        if line.trim().is_empty() {
            continue;
        }
        log.disk_lines += 1;
        match serde_json::from_str::<VerificationResult>(&line) {
            Ok(result) => {
                log.entries.push_front(result);
                log.entries.truncate(limit);
            }
            Err(e) => warn!("skipping malformed history line: {e}"),
        }
    }
    Ok(log)
}

impl FileStore {
    pub fn new(registrations: Vec<Registration>, history_limit: usize) -> Self {
        Self {
            registrations: RwLock::new(
                registrations
                    .into_iter()
                    .map(|r| (r.id.clone(), r))
                    .collect(),
            ),
            history: Mutex::new(HistoryLog::default()),
            history_limit: history_limit.max(1),
            state_dir: None,
        }
    }

    pub fn load(
        registry_file: Option<&Path>,
        state_dir: Option<&Path>,
        history_limit: usize,
    ) -> Result<Self> {
        let mut registrations: Vec<Registration> = match registry_file {
            Some(path) => {
                let content = fs::read_to_string(path)?;
                serde_json::from_str(&content)
                    .with_context(|| format!("invalid registry file {}", path.display()))?
            }
            None => {
                warn!("no registry file configured, every application id is unknown");
                Vec::new()
            }
        };
        let mut history = HistoryLog::default();
        if let Some(dir) = state_dir {
            let baselines_path = dir.join(BASELINES_FILE);
            if baselines_path.exists() {
                let content = fs::read_to_string(&baselines_path)?;
                let baselines: BTreeMap<String, Baseline> = serde_json::from_str(&content)
                    .with_context(|| format!("invalid {}", baselines_path.display()))?;
                for registration in registrations.iter_mut() {
                    if let Some(baseline) = baselines.get(&registration.id) {
                        registration.baseline = Some(baseline.clone());
                    }
                }
            }
            history = load_history(&dir.join(HISTORY_FILE), history_limit.max(1))?;
            if history.disk_lines > history.entries.len() {
                write_atomically(dir, HISTORY_FILE, &history_lines(&history.entries)?)?;
                debug!(
                    dropped = history.disk_lines - history.entries.len(),
                    "history compacted on load"
                );
                history.disk_lines = history.entries.len();
            }
        }
        info!(
            registrations = registrations.len(),
            history = history.entries.len(),
            "registration store loaded"
        );
        let mut store = Self::new(registrations, history_limit);
        store.history = Mutex::new(history);
        store.state_dir = state_dir.map(Path::to_path_buf);
        Ok(store)
    }

    async fn persist_baselines(&self, baselines: &BTreeMap<String, Baseline>) -> Result<()> {
        let Some(dir) = self.state_dir.clone() else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(baselines).context("failed to serialize state")?;
        blocking(move || write_atomically(&dir, BASELINES_FILE, &content)).await
    }

    /// Rewrite the history file with only the retained entries.
    async fn compact(&self, log: &mut HistoryLog) -> Result<()> {
        let Some(dir) = self.state_dir.clone() else {
            return Ok(());
        };
        let content = history_lines(&log.entries)?;
        blocking(move || write_atomically(&dir, HISTORY_FILE, &content)).await?;
        debug!(entries = log.entries.len(), "history compacted");
        log.disk_lines = log.entries.len();
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for FileStore {
    async fn registration(&self, id: &str) -> Option<Registration> {
        self.registrations.read().await.get(id).cloned()
    }

    async fn set_baseline(&self, id: &str, baseline: Baseline) -> Result<(), GateError> {
        let mut registrations = self.registrations.write().await;
        if !registrations.contains_key(id) {
            return Err(GateError::UnknownRegistration(id.to_string()));
        }
        let mut baselines: BTreeMap<String, Baseline> = registrations
            .values()
            .filter_map(|r| Some((r.id.clone(), r.baseline.clone()?)))
            .collect();
        baselines.insert(id.to_string(), baseline.clone());
        self.persist_baselines(&baselines).await?;
        if let Some(registration) = registrations.get_mut(id) {
            registration.baseline = Some(baseline);
        }
        Ok(())
    }

    async fn append_history(&self, result: VerificationResult) -> Result<(), GateError> {
        let mut log = self.history.lock().await;
        if let Some(dir) = self.state_dir.clone() {
            let mut line = serde_json::to_vec(&result).context("failed to serialize history")?;
            line.push(b'\n');
            blocking(move || append_line(&dir, HISTORY_FILE, &line)).await?;
            log.disk_lines += 1;
        }
        log.entries.push_front(result);
        log.entries.truncate(self.history_limit);
        if log.disk_lines > self.history_limit * 2 {
            self.compact(&mut log).await?;
        }
        Ok(())
    }

    async fn history(
        &self,
        registration_id: Option<&str>,
        skip: usize,
        limit: usize,
    ) -> Vec<VerificationResult> {
        self.history
            .lock()
            .await
            .entries
            .iter()
            .filter(|r| registration_id.is_none_or(|id| r.registration_id == id))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gate_types::{DcapResult, GithubResult, MeasurementResult, VerificationStatus};

    fn registration(id: &str) -> Registration {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": id,
            "image_repository": "ghcr.io/acme/hello",
            "github_org": "acme",
            "github_repo": "hello",
            "app_endpoint": "http://10.0.0.5:8080",
            "tdx_proxy_endpoint": "http://10.0.0.5:8081"
        }))
        .unwrap()
    }

    fn result(id: &str, n: u64) -> VerificationResult {
        VerificationResult {
            id: format!("v{n}"),
            registration_id: id.into(),
            status: VerificationStatus::Failed,
            dcap: DcapResult::failed("ERROR", "x"),
            github: GithubResult::failed("x"),
            measurements: MeasurementResult::failed("x"),
            duration_ms: n,
            verified_at: Utc::now(),
            quote_method: None,
            error: None,
        }
    }

    fn baseline() -> Baseline {
        Baseline {
            mrtd: "aa".into(),
            rtmr0: "bb".into(),
            rtmr1: "cc".into(),
            rtmr2: "dd".into(),
            rtmr3: "ee".into(),
        }
    }

    #[tokio::test]
    async fn history_is_capped_and_newest_first() {
        let store = FileStore::new(vec![registration("a"), registration("b")], 3);
        for n in 0..5 {
            let id = if n % 2 == 0 { "a" } else { "b" };
            store.append_history(result(id, n)).await.unwrap();
        }
        let all = store.history(None, 0, 10).await;
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["v4", "v3", "v2"]);

        let only_a = store.history(Some("a"), 1, 10).await;
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].id, "v2");
    }

    #[tokio::test]
    async fn baseline_for_unknown_registration_fails() {
        let store = FileStore::new(vec![], 10);
        assert!(matches!(
            store.set_baseline("nope", baseline()).await,
            Err(GateError::UnknownRegistration(_))
        ));
    }

    #[tokio::test]
    async fn state_dir_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("registry.json");
        std::fs::write(
            &registry,
            serde_json::to_string(&vec![registration("a")]).unwrap(),
        )
        .unwrap();
        let state = dir.path().join("state");

        let store = FileStore::load(Some(&registry), Some(&state), 10).unwrap();
        assert!(store.registration("a").await.unwrap().baseline.is_none());
        store.set_baseline("a", baseline()).await.unwrap();
        store.append_history(result("a", 1)).await.unwrap();
        store.append_history(result("a", 2)).await.unwrap();
        drop(store);

        let reloaded = FileStore::load(Some(&registry), Some(&state), 1).unwrap();
        assert_eq!(
            reloaded.registration("a").await.unwrap().baseline,
            Some(baseline())
        );
        let history = reloaded.history(None, 0, 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "v2");

        let lines = std::fs::read_to_string(state.join(HISTORY_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[tokio::test]
    async fn history_file_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::load(None, Some(dir.path()), 2).unwrap();
        for n in 0..50 {
            store.append_history(result("a", n)).await.unwrap();
            let lines = std::fs::read_to_string(dir.path().join(HISTORY_FILE)).unwrap();
            assert!(lines.lines().count() <= 4, "{} lines after {n}", lines.lines().count());
        }
        assert_eq!(store.history(None, 0, 10).await.len(), 2);
        drop(store);
        let reloaded = FileStore::load(None, Some(dir.path()), 2).unwrap();
        let ids: Vec<_> = reloaded
            .history(None, 0, 10)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["v49", "v48"]);
    }

    #[tokio::test]
    async fn failed_baseline_write_keeps_previous_baseline() {
        let not_a_dir = tempfile::NamedTempFile::new().unwrap();
        let mut store = FileStore::new(vec![registration("a")], 10);
        store.state_dir = Some(not_a_dir.path().to_path_buf());

        assert!(store.set_baseline("a", baseline()).await.is_err());
        assert!(store.registration("a").await.unwrap().baseline.is_none());
    }

    #[test]
    fn partial_baseline_in_registry_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = dir.path().join("registry.json");
        std::fs::write(
            &registry,
            r#"[{"id":"a","name":"a","image_repository":"r","github_org":"o","github_repo":"r",
                "app_endpoint":"http://x","tdx_proxy_endpoint":"http://y","expected_mrtd":"aa"}]"#,
        )
        .unwrap();
        let err = FileStore::load(Some(&registry), None, 10).err().unwrap();
        assert!(format!("{err:#}").contains("baseline is partial"));
    }
}
