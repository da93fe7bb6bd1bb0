//! Model specifications and the treatment-coded design matrices built from them.

use super::spline::SplineBasis;
use crate::error::{FitError, FitResult};
use crate::schema::{AnalysisRecord, Party};
use nalgebra::DMatrix;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const WINDOW_COUNT: usize = 5;

pub const SMOOTH_BASIS_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    EventWindow,
    Party,
    TriggerState,
    PostRuling,
}

/// Level of every factor for one observation, indexed by `Factor as usize`.
pub type Levels = [usize; 4];

impl Factor {
    pub const ALL: [Factor; 4] = [
        Factor::EventWindow,
        Factor::Party,
        Factor::TriggerState,
        Factor::PostRuling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Factor::EventWindow => "event_window",
            Factor::Party => "party",
            Factor::TriggerState => "trigger_state",
            Factor::PostRuling => "post_ruling",
        }
    }

    pub fn level_count(self) -> usize {
        match self {
            Factor::EventWindow => WINDOW_COUNT,
            _ => 2,
        }
    }

    /// Level 0 is the reference: first window, Democrat, non-trigger, pre-ruling.
    pub fn level_of(self, record: &AnalysisRecord) -> usize {
        match self {
            Factor::EventWindow => record.window,
            Factor::Party => usize::from(record.party == Party::Republican),
            Factor::TriggerState => usize::from(record.trigger_state),
            Factor::PostRuling => usize::from(record.post_ruling),
        }
    }
}

pub fn levels_of(record: &AnalysisRecord) -> Levels {
    Factor::ALL.map(|factor| factor.level_of(record))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Term {
    Main(Factor),
    /// Products of the non-reference indicators of every listed factor.
    Interaction(Vec<Factor>),
}

impl Term {
    pub fn factors(&self) -> Vec<Factor> {
        match self {
            Term::Main(factor) => vec![*factor],
            Term::Interaction(factors) => factors.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub hypothesis: String,
    pub terms: Vec<Term>,
    #[serde(default)]
    pub random_intercept: bool,
    #[serde(default)]
    pub smooth_date: bool,
    #[serde(default)]
    pub marginal: Vec<Factor>,
}

impl ModelSpec {
    fn new(name: &str, hypothesis: &str, terms: Vec<Term>) -> Self {
        Self {
            name: name.to_string(),
            hypothesis: hypothesis.to_string(),
            terms,
            random_intercept: false,
            smooth_date: false,
            marginal: Vec::new(),
        }
    }

    fn with_random_intercept(mut self) -> Self {
        self.random_intercept = true;
        self
    }

    fn with_marginal(mut self, factors: &[Factor]) -> Self {
        self.marginal = factors.to_vec();
        self
    }

    /// Without the random intercept; the companion of a mixed model in the
    /// likelihood-ratio test.
    pub fn fixed_companion(&self) -> Self {
        Self {
            name: format!("{}_fixed", self.name),
            random_intercept: false,
            ..self.clone()
        }
    }

    pub fn default_cascade() -> Vec<Self> {
        use Factor::*;
        let main = Term::Main;
        let inter = |factors: &[Factor]| Term::Interaction(factors.to_vec());
        vec![
            ModelSpec::new(
                "m1_window",
                "Decline framing differs across the five event windows",
                vec![main(EventWindow)],
            )
            .with_marginal(&[EventWindow]),
            ModelSpec::new(
                "m2_window_party",
                "Window shifts hold after adjusting for party",
                vec![main(EventWindow), main(Party)],
            ),
            ModelSpec::new(
                "m3_window_party_re",
                "Window and party effects net of legislator-level baselines",
                vec![main(EventWindow), main(Party)],
            )
            .with_random_intercept(),
            ModelSpec::new(
                "m4_window_x_party_re",
                "Parties moved differently across event windows",
                vec![main(EventWindow), main(Party), inter(&[EventWindow, Party])],
            )
            .with_random_intercept()
            .with_marginal(&[EventWindow, Party]),
            ModelSpec::new(
                "m5_ruling_x_trigger_re",
                "The ruling shifted framing differently in trigger-law states",
                vec![main(PostRuling), main(TriggerState), inter(&[PostRuling, TriggerState])],
            )
            .with_random_intercept()
            .with_marginal(&[PostRuling, TriggerState]),
            ModelSpec::new(
                "m6_ruling_x_party_x_trigger_re",
                "The ruling-by-trigger shift differs by party",
                vec![
                    main(PostRuling),
                    main(Party),
                    main(TriggerState),
                    inter(&[PostRuling, Party]),
                    inter(&[PostRuling, TriggerState]),
                    inter(&[Party, TriggerState]),
                    inter(&[PostRuling, Party, TriggerState]),
                ],
            )
            .with_random_intercept()
            .with_marginal(&[PostRuling, Party, TriggerState]),
            ModelSpec {
                smooth_date: true,
                ..ModelSpec::new(
                    "m7_smooth_date_party",
                    "Decline framing follows a smooth trend in time beyond party",
                    vec![main(Party)],
                )
                .with_marginal(&[Party])
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Intercept,
    Indicator(Vec<(Factor, usize)>),
}

impl Column {
    fn value(&self, levels: &Levels) -> f64 {
        match self {
            Column::Intercept => 1.0,
            Column::Indicator(parts) => {
                let on = parts.iter().all(|(factor, level)| levels[*factor as usize] == *level);
                if on { 1.0 } else { 0.0 }
            }
        }
    }
}

/// Column layout fixed from one dataset; reused unchanged for resamples and
/// counterfactual predictions.
#[derive(Debug, Clone)]
pub struct DesignLayout {
    pub columns: Vec<Column>,
    pub names: Vec<String>,
    pub smooth: Option<SplineBasis>,
    pub dropped: Vec<String>,
    window_names: BTreeMap<usize, String>,
}

impl DesignLayout {
    pub fn build(spec: &ModelSpec, records: &[AnalysisRecord]) -> FitResult<Self> {
        if records.is_empty() {
            return Err(FitError::Degenerate("no observations".to_string()));
        }
        if spec.terms.iter().any(|term| term.factors().is_empty()) {
            return Err(FitError::Degenerate(format!("model '{}' has an empty term", spec.name)));
        }
        let window_names: BTreeMap<usize, String> = records
            .iter()
            .map(|r| (r.window, r.window_name.clone()))
            .collect();

        let mut candidates = vec![Column::Intercept];
        for term in &spec.terms {
            for column in indicator_columns(&term.factors()) {
                if !candidates.contains(&column) {
                    candidates.push(column);
                }
            }
        }

        let all_levels: Vec<Levels> = records.iter().map(levels_of).collect();
        let mut layout = Self {
            columns: Vec::new(),
            names: Vec::new(),
            smooth: None,
            dropped: Vec::new(),
            window_names,
        };
        for column in candidates {
            let name = layout.column_name(&column);
            if all_levels.iter().all(|levels| column.value(levels) == 0.0) {
                tracing::warn!(model = %spec.name, column = %name, "dropping all-zero design column");
                layout.dropped.push(name);
                continue;
            }
            layout.columns.push(column);
            layout.names.push(name);
        }

        if spec.smooth_date {
            let days: Vec<f64> = records.iter().map(|r| r.day).collect();
            let basis = SplineBasis::new(&days, SMOOTH_BASIS_SIZE)?;
            for k in 1..=basis.width() {
                layout.names.push(format!("s(day).{k}"));
            }
            layout.smooth = Some(basis);
        }
        Ok(layout)
    }

    pub fn parametric_width(&self) -> usize {
        self.columns.len()
    }

    pub fn width(&self) -> usize {
        self.columns.len() + self.smooth.as_ref().map_or(0, SplineBasis::width)
    }

    pub fn row(&self, levels: &Levels, day: f64) -> Vec<f64> {
        let mut row: Vec<f64> = self.columns.iter().map(|c| c.value(levels)).collect();
        if let Some(basis) = &self.smooth {
            row.extend(basis.row(day));
        }
        row
    }

    pub fn matrix(&self, records: &[AnalysisRecord]) -> DMatrix<f64> {
        self.matrix_with(records, &[])
    }

    pub fn matrix_with(&self, records: &[AnalysisRecord], overrides: &[(Factor, usize)]) -> DMatrix<f64> {
        let values: Vec<f64> = records
            .iter()
            .flat_map(|record| {
                let mut levels = levels_of(record);
                for (factor, level) in overrides {
                    levels[*factor as usize] = *level;
                }
                self.row(&levels, record.day)
            })
            .collect();
        DMatrix::from_row_slice(records.len(), self.width(), &values)
    }

    pub fn level_name(&self, factor: Factor, level: usize) -> String {
        match factor {
            Factor::EventWindow => self
                .window_names
                .get(&level)
                .cloned()
                .unwrap_or_else(|| format!("window{level}")),
            Factor::Party => if level == 0 { "Democrat" } else { "Republican" }.to_string(),
            Factor::TriggerState => if level == 0 { "no" } else { "yes" }.to_string(),
            Factor::PostRuling => if level == 0 { "pre" } else { "post" }.to_string(),
        }
    }

    fn column_name(&self, column: &Column) -> String {
        match column {
            Column::Intercept => "(Intercept)".to_string(),
            Column::Indicator(parts) => parts
                .iter()
                .map(|(factor, level)| format!("{}[{}]", factor.as_str(), self.level_name(*factor, *level)))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }
}

/// Every combination of non-reference levels, first factor varying slowest.
fn indicator_columns(factors: &[Factor]) -> Vec<Column> {
    let mut combos: Vec<Vec<(Factor, usize)>> = vec![Vec::new()];
    for &factor in factors {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                (1..factor.level_count()).map(move |level| {
                    let mut next = prefix.clone();
                    next.push((factor, level));
                    next
                })
            })
            .collect();
    }
    combos.into_iter().map(Column::Indicator).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::testdata::record;

    #[test]
    fn treatment_coding_with_interactions() {
        let spec = ModelSpec::new(
            "m",
            "",
            vec![
                Term::Main(Factor::PostRuling),
                Term::Main(Factor::Party),
                Term::Interaction(vec![Factor::PostRuling, Factor::Party]),
            ],
        );
        let records = vec![
            record(0, 0, false, false, Party::Democrat),
            record(1, 2, true, true, Party::Republican),
            record(2, 3, false, true, Party::Democrat),
        ];
        let layout = DesignLayout::build(&spec, &records).unwrap();
        assert_eq!(
            layout.names,
            vec![
                "(Intercept)",
                "post_ruling[post]",
                "party[Republican]",
                "post_ruling[post]:party[Republican]"
            ]
        );
        let x = layout.matrix(&records);
        let row = |i: usize| x.row(i).iter().copied().collect::<Vec<_>>();
        assert_eq!(row(0), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(row(1), [1.0, 1.0, 1.0, 1.0]);
        assert_eq!(row(2), [1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn all_zero_columns_are_dropped() {
        let spec = ModelSpec::new("m", "", vec![Term::Main(Factor::EventWindow)]);
        let records = vec![
            record(0, 0, false, false, Party::Democrat),
            record(1, 2, false, true, Party::Democrat),
        ];
        let layout = DesignLayout::build(&spec, &records).unwrap();
        assert_eq!(layout.names.len(), 2);
        assert_eq!(layout.dropped.len(), 3);
        assert!(layout.names[1].starts_with("event_window["));
    }

    #[test]
    fn overrides_force_levels() {
        let spec = ModelSpec::new("m", "", vec![Term::Main(Factor::TriggerState)]);
        let records = vec![
            record(0, 0, true, false, Party::Democrat),
            record(1, 0, false, false, Party::Democrat),
        ];
        let layout = DesignLayout::build(&spec, &records).unwrap();
        let forced = layout.matrix_with(&records, &[(Factor::TriggerState, 0)]);
        assert_eq!(forced.column(1).iter().copied().collect::<Vec<_>>(), [0.0, 0.0]);
    }

    #[test]
    fn default_cascade_parses_back_from_yaml() {
        let cascade = ModelSpec::default_cascade();
        let yaml = serde_yaml::to_string(&cascade).unwrap();
        let parsed: Vec<ModelSpec> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, cascade);
        assert_eq!(cascade.len(), 7);
        assert!(cascade.iter().filter(|m| m.random_intercept).count() >= 3);
    }

    #[test]
    fn interaction_terms_read_from_yaml_lists() {
        let yaml = "name: m\nterms: [post_ruling, [post_ruling, trigger_state]]\nrandom_intercept: true\n";
        let spec: ModelSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            spec.terms,
            vec![
                Term::Main(Factor::PostRuling),
                Term::Interaction(vec![Factor::PostRuling, Factor::TriggerState])
            ]
        );
        assert!(spec.random_intercept);
    }
}
