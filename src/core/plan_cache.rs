//! Semantic plan cache.
//!
//! Plans are stored as templates: entities in the goal are replaced by
//! placeholders, and the same surfaces are replaced inside step inputs. A new
//! goal hits the cache when its template text is close enough to a stored one,
//! its placeholders play the same roles (see [`slot_signature`]), and every
//! placeholder the stored steps need can be filled from the new goal's own
//! entities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::{Captures, Regex};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{PlanStep, PlanTemplate};

use super::clock::{Clock, SystemClock};
use super::embedding::{cosine_similarity, decode_embedding, embed_text, encode_embedding};
use super::entities::{extract, placeholders_in, slot_signature, Extraction};

#[derive(Debug, Error)]
pub enum PlanCacheError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite statement failed: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("entity pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),

    #[error("goal has no words to embed")]
    EmptyGoal,

    #[error("stored template {template_id} is corrupt: {reason}")]
    Corrupt { template_id: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanCacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Minimum cosine similarity for a hit
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_ttl_hours() -> u32 {
    24
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            similarity_threshold: default_similarity_threshold(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

/// Steps rehydrated from a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPlan {
    pub steps: Vec<PlanStep>,
    pub similarity_score: f32,
    pub template_id: String,
    pub cache_hit: bool,
}

/// SQLite persistence for plan templates
pub struct TemplateStore {
    db_path: PathBuf,
}

impl TemplateStore {
    pub fn open(db_path: &Path) -> Result<Self, PlanCacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PlanCacheError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.connect()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS plan_templates (
                template_id TEXT PRIMARY KEY,
                template_text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                steps TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_plan_templates_expiry ON plan_templates(expires_at);
            ",
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, PlanCacheError> {
        let connection = Connection::open(&self.db_path).map_err(|source| PlanCacheError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Ok(connection)
    }

    /// Insert or refresh a template
    pub fn upsert(&self, template: &PlanTemplate) -> Result<(), PlanCacheError> {
        self.connect()?.execute(
            "
            INSERT INTO plan_templates (template_id, template_text, embedding, steps, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(template_id) DO UPDATE SET
                embedding = excluded.embedding,
                steps = excluded.steps,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            ",
            params![
                template.template_id,
                template.template_text,
                encode_embedding(&template.embedding),
                serde_json::to_string(&template.steps)?,
                template.created_at.timestamp_millis(),
                template.expires_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Templates still valid at `now`
    pub fn active(&self, now: DateTime<Utc>) -> Result<Vec<PlanTemplate>, PlanCacheError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT template_id, template_text, embedding, steps, created_at, expires_at
             FROM plan_templates WHERE expires_at > ?1 ORDER BY template_id",
        )?;
        let rows = statement.query_map(params![now.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut templates = Vec::new();
        for row in rows {
            let (template_id, template_text, blob, steps, created_at, expires_at) = row?;
            let corrupt = |reason: &str| PlanCacheError::Corrupt {
                template_id: template_id.clone(),
                reason: reason.to_string(),
            };
            let embedding = decode_embedding(&blob).ok_or_else(|| corrupt("embedding blob length"))?;
            let created_at = Utc
                .timestamp_millis_opt(created_at)
                .single()
                .ok_or_else(|| corrupt("created_at"))?;
            let expires_at = Utc
                .timestamp_millis_opt(expires_at)
                .single()
                .ok_or_else(|| corrupt("expires_at"))?;

            templates.push(PlanTemplate {
                steps: serde_json::from_str(&steps)?,
                template_id,
                template_text,
                embedding,
                created_at,
                expires_at,
            });
        }
        Ok(templates)
    }

    /// Delete templates expired at `now`; returns how many were removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, PlanCacheError> {
        Ok(self
            .connect()?
            .execute("DELETE FROM plan_templates WHERE expires_at <= ?1", params![now.timestamp_millis()])?)
    }
}

pub struct SemanticPlanCache {
    store: TemplateStore,
    config: PlanCacheConfig,
    clock: Arc<dyn Clock>,
}

impl SemanticPlanCache {
    pub fn new(store: TemplateStore, config: PlanCacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: TemplateStore, config: PlanCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, config, clock }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Template a goal's plan and persist it. Returns the template id.
    pub fn store_plan(&self, goal: &str, steps: &[PlanStep]) -> Result<String, PlanCacheError> {
        let extraction = extract(goal);
        let embedding = embed_text(&extraction.template_text).ok_or(PlanCacheError::EmptyGoal)?;
        let now = self.clock.now();
        let surfaces = SurfaceReplacer::new(&extraction)?;

        let template = PlanTemplate {
            template_id: template_id(&extraction.template_text),
            template_text: extraction.template_text.clone(),
            embedding,
            steps: steps.iter().map(|s| surfaces.templatize(s)).collect(),
            created_at: now,
            expires_at: now + Duration::hours(i64::from(self.config.ttl_hours)),
        };
        self.store.upsert(&template)?;

        info!(template_id = %template.template_id, template = %template.template_text, "Plan template stored");
        Ok(template.template_id)
    }

    /// Look up a plan for a goal
    pub fn get_plan(&self, goal: &str) -> Result<Option<CachedPlan>, PlanCacheError> {
        let extraction = extract(goal);
        let Some(query) = embed_text(&extraction.template_text) else {
            return Ok(None);
        };

        let mut best: Option<(PlanTemplate, f32)> = None;
        for template in self.store.active(self.clock.now())? {
            let score = cosine_similarity(&query, &template.embedding);
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((template, score));
            }
        }

        let Some((template, score)) = best else {
            debug!(template = %extraction.template_text, "Plan cache miss: no templates");
            return Ok(None);
        };
        if score < self.config.similarity_threshold {
            debug!(template_id = %template.template_id, score, "Plan cache miss: below threshold");
            return Ok(None);
        }
        if slot_signature(&extraction.template_text) != slot_signature(&template.template_text) {
            debug!(
                template_id = %template.template_id,
                template = %extraction.template_text,
                "Plan cache miss: entity roles differ"
            );
            return Ok(None);
        }

        let mut steps = Vec::with_capacity(template.steps.len());
        for step in &template.steps {
            match rehydrate_step(step, &extraction) {
                Some(step) => steps.push(step),
                None => {
                    debug!(template_id = %template.template_id, "Plan cache miss: unresolved placeholder");
                    return Ok(None);
                }
            }
        }

        info!(template_id = %template.template_id, score, "Plan cache hit");
        Ok(Some(CachedPlan {
            steps,
            similarity_score: score,
            template_id: template.template_id,
            cache_hit: true,
        }))
    }

    pub fn purge_expired(&self) -> Result<usize, PlanCacheError> {
        self.store.purge_expired(self.clock.now())
    }
}

/// SHA-256 of the template text, hex encoded
pub fn template_id(template_text: &str) -> String {
    hex::encode(Sha256::digest(template_text.as_bytes()))
}

/// Swaps entity surfaces in step inputs for their placeholders.
///
/// Only whole tokens match: "$5" is left alone inside "$50" and "Rome"
/// inside "Romeo".
struct SurfaceReplacer {
    pattern: Option<Regex>,
    placeholders: HashMap<String, String>,
}

impl SurfaceReplacer {
    fn new(extraction: &Extraction) -> Result<Self, PlanCacheError> {
        let mut placeholders = HashMap::new();
        for entity in &extraction.entities {
            placeholders
                .entry(entity.value.clone())
                .or_insert_with(|| entity.placeholder.clone());
        }

        // Longest surfaces first so "New York City" wins over "New York"
        let mut surfaces: Vec<&str> = placeholders.keys().map(String::as_str).collect();
        surfaces.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let pattern = if surfaces.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = surfaces.into_iter().map(whole_token).collect();
            Some(Regex::new(&alternatives.join("|"))?)
        };
        Ok(Self { pattern, placeholders })
    }

    fn templatize(&self, step: &PlanStep) -> PlanStep {
        let mut step = step.clone();
        if let Some(pattern) = &self.pattern {
            map_strings(&mut step.input, &mut |s| {
                let out = pattern.replace_all(s, |caps: &Captures| {
                    self.placeholders
                        .get(&caps[0])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                });
                Some(out.into_owned())
            });
        }
        step
    }
}

/// Escaped surface, anchored at each end that is a word character
fn whole_token(surface: &str) -> String {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut pattern = String::from("(?:");
    if surface.starts_with(is_word) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(surface));
    if surface.ends_with(is_word) {
        pattern.push_str(r"\b");
    }
    pattern.push(')');
    pattern
}

fn rehydrate_step(step: &PlanStep, extraction: &Extraction) -> Option<PlanStep> {
    let bindings = extraction.bindings();
    let mut step = step.clone();
    let resolved = map_strings(&mut step.input, &mut |s| {
        let mut out = s.to_string();
        for token in placeholders_in(s) {
            out = out.replace(&token, bindings.get(&token)?);
        }
        Some(out)
    });
    resolved.then_some(step)
}

/// Rewrite every string in a JSON value; false if `f` gave up on any of them
fn map_strings(value: &mut serde_json::Value, f: &mut dyn FnMut(&str) -> Option<String>) -> bool {
    match value {
        serde_json::Value::String(s) => match f(s) {
            Some(out) => {
                *s = out;
                true
            }
            None => false,
        },
        serde_json::Value::Array(items) => items.iter_mut().all(|item| map_strings(item, f)),
        serde_json::Value::Object(map) => map.values_mut().all(|item| map_strings(item, f)),
        _ => true,
    }
}
