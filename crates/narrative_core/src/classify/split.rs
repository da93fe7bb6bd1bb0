use crate::schema::NarrativeLabel;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

fn indices_by_label(labels: &[NarrativeLabel]) -> Vec<Vec<usize>> {
    NarrativeLabel::ALL
        .iter()
        .map(|label| {
            labels
                .iter()
                .enumerate()
                .filter(|(_, l)| *l == label)
                .map(|(i, _)| i)
                .collect()
        })
        .collect()
}

/// Per-label shuffle, then the first `round(n * test_fraction)` of each label
/// go to test. A label never lands entirely in test.
pub fn stratified_split(labels: &[NarrativeLabel], test_fraction: f64, seed: u64) -> Split {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = Split {
        train: Vec::new(),
        test: Vec::new(),
    };
    for mut group in indices_by_label(labels) {
        group.shuffle(&mut rng);
        let n_test = ((group.len() as f64 * test_fraction).round() as usize)
            .min(group.len().saturating_sub(1));
        split.test.extend_from_slice(&group[..n_test]);
        split.train.extend_from_slice(&group[n_test..]);
    }
    split.train.sort_unstable();
    split.test.sort_unstable();
    split
}

/// `k` stratified folds over positions `0..labels.len()`. Each label is dealt
/// round-robin after a seeded shuffle, so fold label shares differ by at most one.
pub fn stratified_folds(labels: &[NarrativeLabel], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let k = k.max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];
    let mut next = 0;
    for mut group in indices_by_label(labels) {
        group.shuffle(&mut rng);
        for index in group {
            folds[next % k].push(index);
            next += 1;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    folds.retain(|fold| !fold.is_empty());
    folds
}
