//! Join labeled posts to legislator metadata and derive the covariates the
//! regression models use.

use crate::error::{PipelineError, Result};
use crate::schema::{AnalysisRecord, LabeledPost, Party, Politician};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use time::Date;

/// Five ordered, non-overlapping windows bounded by four breakpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCalendar {
    breakpoints: [Date; 4],
    names: [String; 5],
    ruling_date: Date,
}

impl EventCalendar {
    pub fn new(breakpoints: Vec<Date>, names: Vec<String>, ruling_date: Date) -> Result<Self> {
        let breakpoints: [Date; 4] = breakpoints.try_into().map_err(|given: Vec<Date>| {
            PipelineError::Config(format!("expected 4 event breakpoints, got {}", given.len()))
        })?;
        let names: [String; 5] = names.try_into().map_err(|given: Vec<String>| {
            PipelineError::Config(format!("expected 5 event window names, got {}", given.len()))
        })?;
        if breakpoints.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(PipelineError::Config(
                "event breakpoints must be strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            breakpoints,
            names,
            ruling_date,
        })
    }

    /// Window index for a date. A breakpoint date opens the later window.
    pub fn window_of(&self, date: Date) -> usize {
        self.breakpoints.iter().filter(|bp| **bp <= date).count()
    }

    pub fn window_name(&self, window: usize) -> &str {
        &self.names[window.min(4)]
    }

    pub fn window_names(&self) -> &[String; 5] {
        &self.names
    }

    pub fn breakpoints(&self) -> &[Date; 4] {
        &self.breakpoints
    }

    pub fn is_post_ruling(&self, date: Date) -> bool {
        date >= self.ruling_date
    }
}

/// States with a trigger law, held as upper-case postal codes.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerStates {
    states: BTreeSet<String>,
}

impl TriggerStates {
    pub fn new(states: impl IntoIterator<Item = String>) -> Self {
        Self {
            states: states
                .into_iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, state: &str) -> bool {
        self.states.contains(&state.trim().to_ascii_uppercase())
    }
}

impl Default for TriggerStates {
    /// The thirteen states whose trigger laws were on the books at the time
    /// of the ruling.
    fn default() -> Self {
        Self::new(
            [
                "AR", "ID", "KY", "LA", "MS", "MO", "ND", "OK", "SD", "TN", "TX", "UT", "WY",
            ]
            .into_iter()
            .map(str::to_string),
        )
    }
}

/// Join key shared by posts and politicians.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_ascii_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisSet {
    pub records: Vec<AnalysisRecord>,
    /// Handles of posts that matched no politician, with post counts.
    pub unmatched: BTreeMap<String, usize>,
    pub excluded_independent: usize,
}

impl AnalysisSet {
    pub fn legislator_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.legislator + 1)
            .max()
            .unwrap_or(0)
    }
}

pub fn build_analysis_records(
    posts: &[LabeledPost],
    politicians: &[Politician],
    calendar: &EventCalendar,
    trigger_states: &TriggerStates,
) -> Result<AnalysisSet> {
    let mut by_handle: HashMap<String, &Politician> = HashMap::new();
    for politician in politicians {
        let key = normalize_handle(&politician.handle);
        if by_handle.insert(key.clone(), politician).is_some() {
            return Err(PipelineError::InvalidRecord {
                record: politician.handle.clone(),
                message: format!("duplicate politician handle '{key}'"),
            });
        }
    }

    let mut set = AnalysisSet::default();
    let mut matched: Vec<(&LabeledPost, &Politician)> = Vec::new();
    for post in posts {
        let key = normalize_handle(&post.handle);
        match by_handle.get(&key) {
            Some(politician) if politician.party.is_major() => matched.push((post, politician)),
            Some(_) => set.excluded_independent += 1,
            None => *set.unmatched.entry(key).or_insert(0) += 1,
        }
    }

    let groups: BTreeMap<String, usize> = matched
        .iter()
        .map(|(_, p)| normalize_handle(&p.handle))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(index, handle)| (handle, index))
        .collect();

    let Some(first_date) = matched.iter().map(|(post, _)| post.date).min() else {
        tracing::warn!(
            unmatched = set.unmatched.values().sum::<usize>(),
            excluded_independent = set.excluded_independent,
            "no labeled post joined to a major-party legislator"
        );
        return Err(PipelineError::EmptyAnalysisSet);
    };

    for (post, politician) in matched {
        let handle = normalize_handle(&politician.handle);
        let window = calendar.window_of(post.date);
        set.records.push(AnalysisRecord {
            post_id: post.id.clone(),
            legislator: groups[&handle],
            handle,
            legislator_name: politician.name.clone(),
            date: post.date,
            day: (post.date - first_date).whole_days() as f64,
            label: post.effective_label(),
            party: politician.party,
            state: politician.state.trim().to_ascii_uppercase(),
            trigger_state: trigger_states.contains(&politician.state),
            post_ruling: calendar.is_post_ruling(post.date),
            window,
            window_name: calendar.window_name(window).to_string(),
        });
    }

    if !set.unmatched.is_empty() {
        tracing::warn!(
            handles = set.unmatched.len(),
            posts = set.unmatched.values().sum::<usize>(),
            "posts without a matching politician were dropped"
        );
    }
    tracing::info!(
        records = set.records.len(),
        legislators = groups.len(),
        excluded_independent = set.excluded_independent,
        "analysis records built"
    );
    Ok(set)
}

/// Share of records per party that carry the positive label.
pub fn decline_share_by_party(records: &[AnalysisRecord]) -> BTreeMap<Party, (usize, f64)> {
    let mut tallies: BTreeMap<Party, (usize, usize)> = BTreeMap::new();
    for record in records {
        let entry = tallies.entry(record.party).or_insert((0, 0));
        entry.0 += 1;
        if record.outcome() > 0.5 {
            entry.1 += 1;
        }
    }
    tallies
        .into_iter()
        .map(|(party, (n, positive))| (party, (n, positive as f64 / n as f64)))
        .collect()
}
