use super::models::FittedClassifier;
use super::text::TfidfRecipe;
use super::POSITIVE_LABEL;
use crate::error::{FitError, FitResult, Result};
use crate::schema::{CleanPost, LabeledExample, LabeledPost, NarrativeLabel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Documents transformed and classified per batch.
const PREDICT_BATCH: usize = 1024;

/// Feature recipe plus classifier, both fitted on the training split only.
#[derive(Debug, Serialize, Deserialize)]
pub struct FittedPipeline {
    pub name: String,
    pub params: String,
    pub recipe: TfidfRecipe,
    pub classifier: FittedClassifier,
}

impl FittedPipeline {
    pub fn predict_all<S: AsRef<str>>(&self, texts: &[S]) -> FitResult<Vec<NarrativeLabel>> {
        let mut labels = Vec::with_capacity(texts.len());
        for batch in texts.chunks(PREDICT_BATCH) {
            let decisions = self.classifier.predict(&self.recipe.transform_all(batch))?;
            labels.extend(
                decisions
                    .into_iter()
                    .map(|decline| if decline { POSITIVE_LABEL } else { POSITIVE_LABEL.other() }),
            );
        }
        Ok(labels)
    }

    pub fn predict(&self, text: &str) -> FitResult<NarrativeLabel> {
        let labels = self.predict_all(&[text])?;
        labels
            .into_iter()
            .next()
            .ok_or_else(|| FitError::Degenerate("classifier returned no decision".to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Label every post with the saved pipeline. Manual annotations (matched by
/// post id) are carried through untouched next to the prediction.
pub fn propagate_labels(
    pipeline: &FittedPipeline,
    posts: &[CleanPost],
    annotations: &[LabeledExample],
) -> Result<Vec<LabeledPost>> {
    let manual: HashMap<&str, NarrativeLabel> = annotations
        .iter()
        .map(|example| (example.id.as_str(), example.label))
        .collect();

    let texts: Vec<&str> = posts.iter().map(|post| post.text.as_str()).collect();
    let predicted = pipeline.predict_all(&texts)?;
    let labeled: Vec<LabeledPost> = posts
        .iter()
        .zip(predicted)
        .map(|(post, predicted_label)| LabeledPost {
            id: post.id.clone(),
            handle: post.handle.clone(),
            date: post.date,
            text: post.text.clone(),
            manual_label: manual.get(post.id.as_str()).copied(),
            predicted_label,
        })
        .collect();

    let annotated = labeled.iter().filter(|p| p.manual_label.is_some()).count();
    let disagreements = labeled
        .iter()
        .filter(|p| p.manual_label.is_some_and(|m| m != p.predicted_label))
        .count();
    tracing::info!(
        pipeline = %pipeline.name,
        posts = labeled.len(),
        annotated,
        disagreements,
        "propagated labels"
    );
    Ok(labeled)
}
