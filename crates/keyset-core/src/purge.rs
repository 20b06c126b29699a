//! Physical destruction of keysets parked in `PENDING_DESTRUCTION`.
//!
//! The manager only records intent when a keyset enters `PENDING_DESTRUCTION`.
//! A [`PurgeSweeper`] asks a [`PurgePolicy`] which of those keysets are due and
//! deletes each one through [`KeysetManager::delete_if`], which re-checks the
//! state and the policy against the locked row before any material is destroyed.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::{
    engine::CryptoEngine,
    error::{KeysetError, KeysetResult},
    events::EventSink,
    manager::KeysetManager,
    models::{KeysetCriteria, KeysetId, KeysetMetadata, KeysetQuery, KeysetState},
    store::KeysetStore,
};

const SWEEP_PAGE_SIZE: u32 = 200;

pub trait PurgePolicy: Send + Sync {
    fn should_purge(&self, metadata: &KeysetMetadata, now: OffsetDateTime) -> bool;
}

/// Purge once a keyset has sat in `PENDING_DESTRUCTION` for its grace period.
///
/// Entry into that state is taken from `updated_at`, which only moves on
/// accepted mutations and no mutation is accepted while the keyset is pending.
#[derive(Debug, Clone)]
pub struct RetentionPurgePolicy {
    grace: Duration,
    namespaces: HashMap<String, Duration>,
    keep: HashSet<KeysetId>,
}

#[derive(Debug, Deserialize)]
struct RawRetentionPolicy {
    #[serde(default = "default_grace_days")]
    grace_days: u64,
    #[serde(default)]
    namespaces: HashMap<String, u64>,
    #[serde(default)]
    keep: Vec<KeysetId>,
}

fn default_grace_days() -> u64 {
    30
}

impl Default for RetentionPurgePolicy {
    fn default() -> Self {
        Self::with_grace(Duration::days(default_grace_days() as i64))
    }
}

impl RetentionPurgePolicy {
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            namespaces: HashMap::new(),
            keep: HashSet::new(),
        }
    }

    /// Load from YAML, or JSON when the file extension is `.json`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> KeysetResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(KeysetError::storage)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let raw: RawRetentionPolicy = if is_json {
            serde_json::from_str(&contents).map_err(KeysetError::invalid)?
        } else {
            serde_yaml::from_str(&contents).map_err(KeysetError::invalid)?
        };
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawRetentionPolicy) -> KeysetResult<Self> {
        let namespaces = raw
            .namespaces
            .into_iter()
            .map(|(namespace, days)| Ok((namespace, days_to_duration(days)?)))
            .collect::<KeysetResult<HashMap<_, _>>>()?;
        Ok(Self {
            grace: days_to_duration(raw.grace_days)?,
            namespaces,
            keep: raw.keep.into_iter().collect(),
        })
    }

    pub fn with_namespace_grace(mut self, namespace: impl Into<String>, grace: Duration) -> Self {
        self.namespaces.insert(namespace.into(), grace);
        self
    }

    pub fn keep(mut self, id: KeysetId) -> Self {
        self.keep.insert(id);
        self
    }

    pub fn grace_for(&self, namespace: &str) -> Duration {
        self.namespaces.get(namespace).copied().unwrap_or(self.grace)
    }

    pub fn deadline(&self, metadata: &KeysetMetadata) -> OffsetDateTime {
        metadata.updated_at + self.grace_for(&metadata.namespace)
    }
}

impl PurgePolicy for RetentionPurgePolicy {
    fn should_purge(&self, metadata: &KeysetMetadata, now: OffsetDateTime) -> bool {
        metadata.state == KeysetState::PendingDestruction
            && !self.keep.contains(&metadata.id)
            && now >= self.deadline(metadata)
    }
}

fn days_to_duration(days: u64) -> KeysetResult<Duration> {
    let days = i64::try_from(days).map_err(|_| KeysetError::invalid("retention days overflow"))?;
    Ok(Duration::days(days))
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub examined: usize,
    pub purged: Vec<KeysetId>,
    /// Selected as due, but rescued or otherwise changed before deletion.
    pub skipped: Vec<KeysetId>,
    pub failed: Vec<(KeysetId, String)>,
}

pub struct PurgeSweeper<S, C, E>
where
    S: KeysetStore + ?Sized,
    C: CryptoEngine + ?Sized,
    E: EventSink + ?Sized,
{
    manager: Arc<KeysetManager<S, C, E>>,
    policy: Arc<dyn PurgePolicy>,
}

impl<S, C, E> Clone for PurgeSweeper<S, C, E>
where
    S: KeysetStore + ?Sized,
    C: CryptoEngine + ?Sized,
    E: EventSink + ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<S, C, E> PurgeSweeper<S, C, E>
where
    S: KeysetStore + ?Sized,
    C: CryptoEngine + ?Sized,
    E: EventSink + ?Sized,
{
    pub fn new(manager: Arc<KeysetManager<S, C, E>>, policy: Arc<dyn PurgePolicy>) -> Self {
        Self { manager, policy }
    }

    /// One sweep. Failures on individual keysets are reported, not raised.
    pub fn run_once(&self, now: OffsetDateTime) -> KeysetResult<PurgeReport> {
        let mut report = PurgeReport::default();
        let mut due = Vec::new();
        let mut query = KeysetQuery {
            criteria: KeysetCriteria {
                state: Some(KeysetState::PendingDestruction),
                ..Default::default()
            },
            per_page: SWEEP_PAGE_SIZE,
            ..Default::default()
        };
        // Collect first; deleting while paging would shift later pages.
        loop {
            let page = self.manager.find(&query)?;
            report.examined += page.items.len();
            due.extend(
                page.items
                    .iter()
                    .filter(|metadata| self.policy.should_purge(metadata, now))
                    .map(|metadata| metadata.id),
            );
            if !page.has_more {
                break;
            }
            query.page += 1;
        }

        for id in due {
            let still_due = |metadata: &KeysetMetadata| {
                metadata.state == KeysetState::PendingDestruction
                    && self.policy.should_purge(metadata, now)
            };
            match self.manager.delete_if(&id, still_due) {
                Ok(true) => {
                    metrics::counter!("keyset_purged_total").increment(1);
                    report.purged.push(id);
                }
                Ok(false) => {
                    info!(keyset = %id, "keyset no longer due for purge");
                    report.skipped.push(id);
                }
                Err(KeysetError::NotFound(_)) => {
                    debug!(keyset = %id, "keyset already removed before purge");
                }
                Err(err) => {
                    warn!(keyset = %id, error = %err, "failed to purge keyset");
                    report.failed.push((id, err.to_string()));
                }
            }
        }

        info!(
            examined = report.examined,
            purged = report.purged.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "purge sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeysetAlgorithm, KeysetMetadataDefinition};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pending(namespace: &str, since: OffsetDateTime) -> KeysetMetadata {
        let def = KeysetMetadataDefinition::new(
            namespace,
            KeysetAlgorithm::Aes256Gcm,
            "expiring",
            None,
            Vec::new(),
            None,
        )
        .unwrap();
        let mut metadata = KeysetMetadata::from_definition(&def, since);
        metadata.state = KeysetState::PendingDestruction;
        metadata
    }

    #[test]
    fn grace_period_is_measured_from_last_update() {
        let now = OffsetDateTime::now_utc();
        let policy = RetentionPurgePolicy::with_grace(Duration::days(7));
        assert!(policy.should_purge(&pending("t", now - Duration::days(8)), now));
        assert!(!policy.should_purge(&pending("t", now - Duration::days(6)), now));

        let mut active = pending("t", now - Duration::days(30));
        active.state = KeysetState::Active;
        assert!(!policy.should_purge(&active, now));
    }

    #[test]
    fn namespace_override_and_keep_list_apply() {
        let now = OffsetDateTime::now_utc();
        let held = pending("t", now - Duration::days(60));
        let policy = RetentionPurgePolicy::with_grace(Duration::days(7))
            .with_namespace_grace("slow", Duration::days(90))
            .keep(held.id);
        assert!(!policy.should_purge(&held, now));
        assert!(!policy.should_purge(&pending("slow", now - Duration::days(60)), now));
        assert!(policy.should_purge(&pending("t", now - Duration::days(60)), now));
    }

    #[test]
    fn loads_yaml_and_json() {
        let mut yaml = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(yaml, "grace_days: 3\nnamespaces:\n  slow: 45\n").unwrap();
        let policy = RetentionPurgePolicy::from_path(yaml.path()).unwrap();
        assert_eq!(policy.grace_for("any"), Duration::days(3));
        assert_eq!(policy.grace_for("slow"), Duration::days(45));

        let mut json = NamedTempFile::with_suffix(".json").unwrap();
        write!(json, r#"{{"keep": ["00000000-0000-0000-0000-000000000001"]}}"#).unwrap();
        let policy = RetentionPurgePolicy::from_path(json.path()).unwrap();
        assert_eq!(policy.grace_for("any"), Duration::days(30));
        assert_eq!(policy.keep.len(), 1);
    }
}
