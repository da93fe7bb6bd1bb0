//! Feature extraction: tokenize, drop stop words, truncate the vocabulary,
//! weight by tf-idf, L2-normalise.

use ndarray::{Array1, Array2};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

static RE_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").expect("valid URL regex"));
static RE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("valid token regex"));

const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "aren", "as", "at", "be", "because", "been", "before", "being", "below", "between",
    "both", "but", "by", "can", "could", "couldn", "did", "didn", "do", "does", "doesn", "doing",
    "don", "down", "during", "each", "even", "ever", "every", "few", "for", "from", "further",
    "had", "hadn", "has", "hasn", "have", "haven", "having", "he", "her", "here", "hers",
    "herself", "him", "himself", "his", "how", "however", "if", "in", "into", "is", "isn", "it",
    "its", "itself", "just", "ll", "me", "might", "more", "most", "must", "mustn", "my",
    "myself", "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other",
    "our", "ours", "ourselves", "out", "over", "own", "re", "same", "shall", "she", "should",
    "shouldn", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "us", "ve", "very", "was", "wasn", "we", "were", "weren", "what",
    "when", "where", "which", "while", "who", "whom", "why", "will", "with", "won", "would",
    "wouldn", "yet", "you", "your", "yours", "yourself", "yourselves", "amp", "rt",
];

pub fn tokenize(text: &str, stop_words: &BTreeSet<String>) -> Vec<String> {
    let lowered = text.to_lowercase();
    let stripped = RE_URL.replace_all(&lowered, " ");
    RE_TOKEN
        .find_iter(&stripped)
        .map(|m| m.as_str())
        .filter(|token| !stop_words.contains(*token))
        .map(str::to_string)
        .collect()
}

/// Fitted once on the training split, then only applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TfidfRecipe {
    vocabulary: BTreeMap<String, usize>,
    idf: Vec<f64>,
    stop_words: BTreeSet<String>,
}

impl TfidfRecipe {
    pub fn fit<S: AsRef<str>>(docs: &[S], max_features: usize, extra_stop_words: &[String]) -> Self {
        let stop_words: BTreeSet<String> = ENGLISH_STOP_WORDS
            .iter()
            .map(|w| w.to_string())
            .chain(extra_stop_words.iter().map(|w| w.to_lowercase()))
            .collect();

        let mut term_counts: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let tokens = tokenize(doc.as_ref(), &stop_words);
            let mut seen = BTreeSet::new();
            for token in tokens {
                *term_counts.entry(token.clone()).or_insert(0) += 1;
                if seen.insert(token.clone()) {
                    *doc_freq.entry(token).or_insert(0) += 1;
                }
            }
        }

        // most frequent terms first; alphabetical among equals
        let mut ranked: Vec<(String, usize)> = term_counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_features);

        let kept: BTreeSet<String> = ranked.into_iter().map(|(term, _)| term).collect();
        let vocabulary: BTreeMap<String, usize> = kept
            .into_iter()
            .enumerate()
            .map(|(index, term)| (term, index))
            .collect();

        let n = docs.len() as f64;
        let mut idf = vec![0.0; vocabulary.len()];
        for (term, &index) in &vocabulary {
            let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
            idf[index] = ((1.0 + n) / (1.0 + df)).ln() + 1.0;
        }

        tracing::debug!(documents = docs.len(), vocabulary = vocabulary.len(), "fitted tf-idf recipe");
        Self {
            vocabulary,
            idf,
            stop_words,
        }
    }

    pub fn n_features(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn transform(&self, doc: &str) -> Array1<f64> {
        let mut row: Array1<f64> = Array1::zeros(self.n_features());
        for token in tokenize(doc, &self.stop_words) {
            if let Some(&index) = self.vocabulary.get(&token) {
                row[index] += self.idf[index];
            }
        }
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
        row
    }

    /// One row per document.
    pub fn transform_all<S: AsRef<str>>(&self, docs: &[S]) -> Array2<f64> {
        let mut x = Array2::zeros((docs.len(), self.n_features()));
        for (mut row, doc) in x.rows_mut().into_iter().zip(docs) {
            row.assign(&self.transform(doc.as_ref()));
        }
        x
    }
}
