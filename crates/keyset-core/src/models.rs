use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{KeysetError, KeysetResult};

pub type KeysetId = Uuid;
pub type Namespace = String;

const MAX_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 1024;
const MAX_TAG_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeysetAlgorithm {
    #[serde(rename = "AES128_GCM")]
    Aes128Gcm,
    #[serde(rename = "AES256_GCM")]
    Aes256Gcm,
    #[serde(rename = "CHACHA20_POLY1305")]
    ChaCha20Poly1305,
    #[serde(rename = "XCHACHA20_POLY1305")]
    XChaCha20Poly1305,
    #[serde(rename = "ECDSA_P256")]
    EcdsaP256,
    #[serde(rename = "ECDSA_P384")]
    EcdsaP384,
    #[serde(rename = "ED25519")]
    Ed25519,
}

impl KeysetAlgorithm {
    /// Every algorithm accepted at creation time.
    pub const ALL: [KeysetAlgorithm; 7] = [
        KeysetAlgorithm::Aes128Gcm,
        KeysetAlgorithm::Aes256Gcm,
        KeysetAlgorithm::ChaCha20Poly1305,
        KeysetAlgorithm::XChaCha20Poly1305,
        KeysetAlgorithm::EcdsaP256,
        KeysetAlgorithm::EcdsaP384,
        KeysetAlgorithm::Ed25519,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeysetAlgorithm::Aes128Gcm => "AES128_GCM",
            KeysetAlgorithm::Aes256Gcm => "AES256_GCM",
            KeysetAlgorithm::ChaCha20Poly1305 => "CHACHA20_POLY1305",
            KeysetAlgorithm::XChaCha20Poly1305 => "XCHACHA20_POLY1305",
            KeysetAlgorithm::EcdsaP256 => "ECDSA_P256",
            KeysetAlgorithm::EcdsaP384 => "ECDSA_P384",
            KeysetAlgorithm::Ed25519 => "ED25519",
        }
    }
}

impl fmt::Display for KeysetAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeysetAlgorithm {
    type Err = KeysetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        KeysetAlgorithm::ALL
            .into_iter()
            .find(|alg| alg.as_str() == normalized)
            .ok_or_else(|| KeysetError::invalid(format!("unknown algorithm '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeysetState {
    Active,
    Inactive,
    PendingDestruction,
    Destroyed,
}

impl KeysetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeysetState::Active => "ACTIVE",
            KeysetState::Inactive => "INACTIVE",
            KeysetState::PendingDestruction => "PENDING_DESTRUCTION",
            KeysetState::Destroyed => "DESTROYED",
        }
    }
}

impl fmt::Display for KeysetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeysetState {
    type Err = KeysetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ACTIVE" => Ok(KeysetState::Active),
            "INACTIVE" => Ok(KeysetState::Inactive),
            "PENDING_DESTRUCTION" => Ok(KeysetState::PendingDestruction),
            "DESTROYED" => Ok(KeysetState::Destroyed),
            other => Err(KeysetError::invalid(format!("unknown keyset state '{other}'"))),
        }
    }
}

/// Persisted description of one keyset. Key material lives in the crypto engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysetMetadata {
    pub id: KeysetId,
    pub namespace: Namespace,
    pub name: String,
    pub algorithm: KeysetAlgorithm,
    pub state: KeysetState,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period: Option<Duration>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_rotated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub destroyed_at: Option<OffsetDateTime>,
}

impl KeysetMetadata {
    pub fn from_definition(definition: &KeysetMetadataDefinition, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: definition.namespace.clone(),
            name: definition.name.clone(),
            algorithm: definition.algorithm,
            state: KeysetState::Active,
            description: definition.description.clone(),
            tags: definition.tags.clone(),
            rotation_period: definition.rotation_period,
            created_at: now,
            updated_at: now,
            last_rotated_at: None,
            destroyed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == KeysetState::Active
    }

    /// Whether the rotation hint says a new key version is overdue.
    pub fn rotation_due(&self, now: OffsetDateTime) -> bool {
        match self.rotation_period {
            Some(period) => now - self.last_rotated_at.unwrap_or(self.created_at) >= period,
            None => false,
        }
    }
}

/// Validated creation input for a keyset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetMetadataDefinition {
    namespace: Namespace,
    algorithm: KeysetAlgorithm,
    name: String,
    description: Option<String>,
    tags: BTreeSet<String>,
    rotation_period: Option<Duration>,
}

impl KeysetMetadataDefinition {
    pub fn new(
        namespace: impl Into<String>,
        algorithm: KeysetAlgorithm,
        name: impl Into<String>,
        description: Option<String>,
        tags: impl IntoIterator<Item = String>,
        rotation_period: Option<Duration>,
    ) -> KeysetResult<Self> {
        let namespace = namespace.into().trim().to_string();
        if namespace.is_empty() {
            return Err(KeysetError::invalid("namespace must not be blank"));
        }
        let name = validate_name(name.into())?;
        if let Some(period) = rotation_period
            && !period.is_positive()
        {
            return Err(KeysetError::invalid("rotation period must be positive"));
        }
        Ok(Self {
            namespace,
            algorithm,
            name,
            description: normalize_description(description)?,
            tags: normalize_tags(tags)?,
            rotation_period,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn algorithm(&self) -> KeysetAlgorithm {
        self.algorithm
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn rotation_period(&self) -> Option<Duration> {
        self.rotation_period
    }
}

fn validate_name(name: String) -> KeysetResult<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(KeysetError::invalid("keyset name must not be blank"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(KeysetError::invalid(format!(
            "keyset name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(KeysetError::invalid(
            "keyset name may only contain ASCII letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(name)
}

/// Blank descriptions clear the field.
pub(crate) fn normalize_description(description: Option<String>) -> KeysetResult<Option<String>> {
    let Some(description) = description else {
        return Ok(None);
    };
    let description = description.trim();
    if description.is_empty() {
        return Ok(None);
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(KeysetError::invalid(format!(
            "description exceeds {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(Some(description.to_string()))
}

pub(crate) fn normalize_tags(
    tags: impl IntoIterator<Item = String>,
) -> KeysetResult<BTreeSet<String>> {
    let mut normalized = BTreeSet::new();
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(KeysetError::invalid("tags must not be blank"));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(KeysetError::invalid(format!(
                "tag '{tag}' exceeds {MAX_TAG_LEN} characters"
            )));
        }
        normalized.insert(tag.to_string());
    }
    Ok(normalized)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KeysetCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<KeysetAlgorithm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<KeysetState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<KeysetId>,
}

impl KeysetCriteria {
    pub fn matches(&self, metadata: &KeysetMetadata) -> bool {
        self.namespace
            .as_ref()
            .is_none_or(|ns| ns == &metadata.namespace)
            && self.algorithm.is_none_or(|alg| alg == metadata.algorithm)
            && self.state.is_none_or(|state| state == metadata.state)
            && self.id.is_none_or(|id| id == metadata.id)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeysetSort {
    /// Creation order, oldest first.
    #[default]
    Created,
    NameAsc,
    NameDesc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct KeysetQuery {
    #[serde(default)]
    pub criteria: KeysetCriteria,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    #[serde(default)]
    pub sort: KeysetSort,
    pub page: u32,
    pub per_page: u32,
}

impl Default for KeysetQuery {
    fn default() -> Self {
        Self {
            criteria: KeysetCriteria::default(),
            term: None,
            sort: KeysetSort::Created,
            page: 1,
            per_page: 50,
        }
    }
}

impl KeysetQuery {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            criteria: KeysetCriteria {
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Lower-cased search term, or `None` when blank.
    pub fn normalized_term(&self) -> Option<String> {
        self.term
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase)
    }

    pub fn effective_page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn effective_per_page(&self) -> u32 {
        self.per_page.clamp(1, 1000)
    }

    pub fn offset(&self) -> usize {
        (self.effective_page() as usize - 1).saturating_mul(self.effective_per_page() as usize)
    }

    pub fn matches_term(&self, metadata: &KeysetMetadata) -> bool {
        let Some(term) = self.normalized_term() else {
            return true;
        };
        metadata.name.to_lowercase().contains(&term)
            || metadata
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&term))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysetPage {
    pub items: Vec<KeysetMetadata>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
    pub has_more: bool,
}

impl KeysetPage {
    pub fn new(items: Vec<KeysetMetadata>, total: usize, query: &KeysetQuery) -> Self {
        let has_more = query.offset() + items.len() < total;
        Self {
            items,
            total,
            page: query.effective_page(),
            per_page: query.effective_per_page(),
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> KeysetResult<KeysetMetadataDefinition> {
        KeysetMetadataDefinition::new(
            "tenant-a",
            KeysetAlgorithm::Aes256Gcm,
            name,
            Some("  payments key  ".into()),
            vec!["pci".to_string(), "pci".to_string(), " ops ".to_string()],
            None,
        )
    }

    #[test]
    fn definition_normalizes_fields() {
        let def = definition("payments").expect("valid definition");
        assert_eq!(def.description(), Some("payments key"));
        assert_eq!(
            def.tags().iter().cloned().collect::<Vec<_>>(),
            vec!["ops".to_string(), "pci".to_string()]
        );
    }

    #[test]
    fn definition_rejects_bad_names() {
        assert!(matches!(
            definition("  "),
            Err(KeysetError::InvalidRequest(_))
        ));
        assert!(matches!(
            definition("a/b"),
            Err(KeysetError::InvalidRequest(_))
        ));
        assert!(matches!(
            definition(&"x".repeat(MAX_NAME_LEN + 1)),
            Err(KeysetError::InvalidRequest(_))
        ));
    }

    #[test]
    fn definition_rejects_non_positive_rotation_period() {
        let result = KeysetMetadataDefinition::new(
            "tenant-a",
            KeysetAlgorithm::Ed25519,
            "signer",
            None,
            Vec::new(),
            Some(Duration::ZERO),
        );
        assert!(matches!(result, Err(KeysetError::InvalidRequest(_))));
    }

    #[test]
    fn parses_algorithm_and_state_labels() {
        assert_eq!(
            "aes256-gcm".parse::<KeysetAlgorithm>().unwrap(),
            KeysetAlgorithm::Aes256Gcm
        );
        assert_eq!(
            "pending_destruction".parse::<KeysetState>().unwrap(),
            KeysetState::PendingDestruction
        );
        assert!("rsa".parse::<KeysetAlgorithm>().is_err());
    }

    #[test]
    fn rotation_due_tracks_last_rotation() {
        let created = OffsetDateTime::now_utc() - Duration::days(40);
        let def = KeysetMetadataDefinition::new(
            "tenant-a",
            KeysetAlgorithm::Aes128Gcm,
            "rotating",
            None,
            Vec::new(),
            Some(Duration::days(30)),
        )
        .unwrap();
        let mut metadata = KeysetMetadata::from_definition(&def, created);
        let now = OffsetDateTime::now_utc();
        assert!(metadata.rotation_due(now));
        metadata.last_rotated_at = Some(now - Duration::days(1));
        assert!(!metadata.rotation_due(now));
    }

    #[test]
    fn term_matches_name_or_description_case_insensitively() {
        let def = definition("Payments-Primary").unwrap();
        let metadata = KeysetMetadata::from_definition(&def, OffsetDateTime::now_utc());
        let mut query = KeysetQuery {
            term: Some("PRIMARY".into()),
            ..Default::default()
        };
        assert!(query.matches_term(&metadata));
        query.term = Some("KEY".into());
        assert!(query.matches_term(&metadata));
        query.term = Some("ledger".into());
        assert!(!query.matches_term(&metadata));
    }
}
