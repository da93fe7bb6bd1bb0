use crate::analysis::{EventCalendar, TriggerStates};
use crate::classify::{BenchConfig, ClassifierSpec};
use crate::stats::ModelSpec;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use time::macros::format_description;
use time::Date;

/// Everything a study run needs, loaded from one config directory.
#[derive(Debug, Clone)]
pub struct StudyConfig {
    pub collection: CollectionConfig,
    pub topic: TopicConfig,
    pub calendar: EventCalendar,
    pub classification: BenchConfig,
    pub modeling: ModelingConfig,
    pub classifiers: Vec<ClassifierSpec>,
    pub cascade: Vec<ModelSpec>,
    pub trigger_states: TriggerStates,
}

#[derive(Debug, Clone)]
pub struct CollectionConfig {
    pub start_date: Date,
    pub end_date: Date,
    pub max_posts: Option<u64>,
    pub page_size: u32,
    pub page_delay_ms: u64,
    pub bearer_env: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub stem: String,
    #[serde(default = "default_case_insensitive")]
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelingConfig {
    #[serde(default = "default_significance")]
    pub significance: f64,
    #[serde(default = "default_dispersion_threshold")]
    pub dispersion_threshold: f64,
    #[serde(default = "default_bootstrap_replicates")]
    pub bootstrap_replicates: usize,
    #[serde(default)]
    pub bootstrap_seed: u64,
    /// Cascade model refit on every bootstrap resample.
    pub bootstrap_model: String,
}

impl Default for ModelingConfig {
    fn default() -> Self {
        Self {
            significance: default_significance(),
            dispersion_threshold: default_dispersion_threshold(),
            bootstrap_replicates: default_bootstrap_replicates(),
            bootstrap_seed: 2022,
            bootstrap_model: "m5_ruling_x_trigger_re".to_string(),
        }
    }
}

fn default_case_insensitive() -> bool {
    true
}

fn default_significance() -> f64 {
    0.10
}

fn default_dispersion_threshold() -> f64 {
    1.5
}

fn default_bootstrap_replicates() -> usize {
    1000
}

fn default_base_url() -> String {
    "https://api.twitter.com/2".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StudyFile {
    collection: CollectionFile,
    topic: TopicConfig,
    events: EventsFile,
    classification: BenchConfig,
    modeling: ModelingConfig,
}

#[derive(Debug, Clone, Deserialize)]
struct CollectionFile {
    start_date: String,
    end_date: String,
    max_posts: Option<u64>,
    page_size: u32,
    #[serde(default)]
    page_delay_ms: u64,
    bearer_env: String,
    #[serde(default = "default_base_url")]
    base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EventsFile {
    breakpoints: Vec<String>,
    windows: Vec<String>,
    ruling_date: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifiersFile {
    classifiers: Vec<ClassifierSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct CascadeFile {
    models: Vec<ModelSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct TriggerStatesFile {
    states: Vec<String>,
}

impl StudyConfig {
    /// Load `study.toml` plus the optional YAML files next to it. A missing
    /// YAML file falls back to the built-in list for that concern.
    pub fn load_from_dir(path: &Path) -> Result<Self> {
        let study_path = path.join("study.toml");
        let study_str = fs::read_to_string(&study_path)
            .with_context(|| format!("Failed to read config file: {}", study_path.display()))?;
        let study: StudyFile = toml::from_str(&study_str)
            .with_context(|| format!("Failed to parse config file: {}", study_path.display()))?;

        let classifiers = match read_optional(&path.join("classifiers.yaml"))? {
            Some(raw) => serde_yaml::from_str::<ClassifiersFile>(&raw)
                .context("Failed to parse classifiers.yaml")?
                .classifiers,
            None => ClassifierSpec::default_bench(),
        };

        let cascade = match read_optional(&path.join("cascade.yaml"))? {
            Some(raw) => serde_yaml::from_str::<CascadeFile>(&raw)
                .context("Failed to parse cascade.yaml")?
                .models,
            None => ModelSpec::default_cascade(),
        };

        let trigger_states = match read_optional(&path.join("trigger_states.yaml"))? {
            Some(raw) => TriggerStates::new(
                serde_yaml::from_str::<TriggerStatesFile>(&raw)
                    .context("Failed to parse trigger_states.yaml")?
                    .states,
            ),
            None => TriggerStates::default(),
        };

        let config = Self {
            collection: parse_collection(study.collection)?,
            topic: study.topic,
            calendar: parse_events(study.events)?,
            classification: study.classification,
            modeling: study.modeling,
            classifiers,
            cascade,
            trigger_states,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.topic.stem.trim().is_empty() {
            return Err(anyhow!("topic.stem must not be empty"));
        }
        let fraction = self.classification.test_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(anyhow!("classification.test_fraction must be in (0, 1), got {fraction}"));
        }
        if self.classification.cv_folds < 2 {
            return Err(anyhow!("classification.cv_folds must be at least 2"));
        }
        if !(self.modeling.significance > 0.0 && self.modeling.significance < 1.0) {
            return Err(anyhow!("modeling.significance must be in (0, 1)"));
        }
        if self.classifiers.is_empty() {
            return Err(anyhow!("no classifiers configured"));
        }
        let mut names: Vec<&str> = self.cascade.iter().map(|m| m.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(anyhow!("cascade model names must be unique"));
        }
        if self.modeling.bootstrap_replicates > 0
            && !self.cascade.iter().any(|m| m.name == self.modeling.bootstrap_model)
        {
            return Err(anyhow!(
                "modeling.bootstrap_model '{}' is not a cascade model",
                self.modeling.bootstrap_model
            ));
        }
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "config file absent, using built-in defaults");
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Ok(Some(raw))
}

fn parse_collection(file: CollectionFile) -> Result<CollectionConfig> {
    let start_date = parse_date(&file.start_date)?;
    let end_date = parse_date(&file.end_date)?;
    if end_date < start_date {
        return Err(anyhow!("collection.end_date precedes collection.start_date"));
    }
    if file.page_size == 0 {
        return Err(anyhow!("collection.page_size must be positive"));
    }
    Ok(CollectionConfig {
        start_date,
        end_date,
        max_posts: file.max_posts,
        page_size: file.page_size,
        page_delay_ms: file.page_delay_ms,
        bearer_env: file.bearer_env,
        base_url: file.base_url,
    })
}

fn parse_events(file: EventsFile) -> Result<EventCalendar> {
    let breakpoints = file
        .breakpoints
        .iter()
        .map(|value| parse_date(value))
        .collect::<Result<Vec<_>>>()?;
    let ruling_date = parse_date(&file.ruling_date)?;
    EventCalendar::new(breakpoints, file.windows, ruling_date).map_err(|err| anyhow!("{err}"))
}

pub fn parse_date(value: &str) -> Result<Date> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| anyhow!("Invalid date '{value}': {err}"))
}
