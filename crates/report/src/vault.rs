use anyhow::{Context, Result};
use narrative_core::classify::BenchReport;
use narrative_core::stats::{
    BootstrapReport, Family, ModelFit, ModelOutcome, RobustnessReport,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const GENERATED: &str = "This note is generated. Do not edit manually.";

pub struct ReportPaths {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub classifiers_dir: PathBuf,
    pub models_dir: PathBuf,
    pub robustness_dir: PathBuf,
}

impl ReportPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("00_Index"),
            classifiers_dir: root.join("Classifiers"),
            models_dir: root.join("Models"),
            robustness_dir: root.join("Robustness"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.index_dir,
            &self.classifiers_dir,
            &self.models_dir,
            &self.robustness_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create report directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Classifier comparison note, then the index.
pub fn write_bench_report(root: &Path, report: &BenchReport) -> Result<()> {
    let paths = ReportPaths::new(root);
    paths.ensure()?;

    let mut md = frontmatter(&[("kind", "classifier_comparison".to_string())])?;
    md.push_str("# Classifier Comparison\n\n");
    md.push_str(&format!("{GENERATED}\n\n"));

    let split = &report.split;
    md.push_str("## Split\n");
    md.push_str(&format!("- Train: {} ({:.1}% decline)\n", split.train, split.train_decline_share * 100.0));
    md.push_str(&format!("- Test: {} ({:.1}% decline)\n", split.test, split.test_decline_share * 100.0));
    md.push_str(&format!("- Vocabulary: {}\n\n", split.vocabulary));

    md.push_str("## Ranking\n\n");
    if report.ranked.is_empty() {
        md.push_str("_No classifier produced a usable fit._\n");
    } else {
        md.push_str("| Rank | Classifier | Algorithm | Params | CV accuracy | Accuracy | Recall | Precision | F1 |\n");
        md.push_str("|---|---|---|---|---|---|---|---|---|\n");
        for (rank, model) in report.ranked.iter().enumerate() {
            let cv = model
                .cv_accuracy
                .map(|v| format!("{v:.3}"))
                .unwrap_or_else(|| "-".to_string());
            let m = &model.metrics;
            md.push_str(&format!(
                "| {} | {} | {} | `{}` | {} | {:.3} | {:.3} | {:.3} | {:.3} |\n",
                rank + 1,
                model.name,
                model.algorithm,
                model.params,
                cv,
                m.accuracy,
                m.recall,
                m.precision,
                m.f1
            ));
        }
    }

    if let Some(best) = report.best() {
        let m = &best.metrics;
        md.push_str(&format!("\n## Best: {}\n\n", best.name));
        md.push_str("| | actual decline | actual rising |\n|---|---|---|\n");
        md.push_str(&format!("| predicted decline | {} | {} |\n", m.true_positive, m.false_positive));
        md.push_str(&format!("| predicted rising | {} | {} |\n", m.false_negative, m.true_negative));
    }

    if !report.failed.is_empty() {
        md.push_str("\n## Failed\n");
        for failed in &report.failed {
            md.push_str(&format!("- {} ({}): {}\n", failed.name, failed.algorithm, failed.error));
        }
    }

    fs::write(paths.classifiers_dir.join("Comparison.md"), md)?;
    write_index(root)
}

/// One note per cascade model, the robustness note, then the index.
pub fn write_analysis_report(
    root: &Path,
    outcomes: &[ModelOutcome],
    robustness: &RobustnessReport,
) -> Result<()> {
    let paths = ReportPaths::new(root);
    paths.ensure()?;

    let mut moc = vec![
        "# MOC - Models".to_string(),
        String::new(),
        GENERATED.to_string(),
        String::new(),
        "| Model | Family | AIC | Status |".to_string(),
        "|---|---|---|---|".to_string(),
    ];

    for outcome in outcomes {
        match outcome {
            ModelOutcome::Fitted(fit) => {
                write_model_note(&paths, fit)?;
                moc.push(format!(
                    "| [[Models/{0}|{0}]] | {1} | {2:.2} | fitted |",
                    fit.name,
                    family_label(fit.family),
                    fit.aic
                ));
            }
            ModelOutcome::Failed { name, hypothesis, failure } => {
                let mut md = frontmatter(&[
                    ("model", name.clone()),
                    ("status", "failed".to_string()),
                    ("failure_json", serde_json::to_string(failure)?),
                ])?;
                md.push_str(&format!("# {name}\n\n"));
                md.push_str(&format!("> {hypothesis}\n\n"));
                md.push_str(&format!("Fit failed ({}): {}\n", failure.kind, failure.message));
                fs::write(paths.models_dir.join(format!("{name}.md")), md)?;
                moc.push(format!("| [[Models/{name}|{name}]] | - | - | failed: {} |", failure.kind));
            }
        }
    }

    fs::write(paths.index_dir.join("MOC - Models.md"), moc.join("\n"))?;
    write_robustness_note(&paths, robustness)?;
    tracing::info!(root = %root.display(), models = outcomes.len(), "Wrote analysis report");
    write_index(root)
}

fn write_model_note(paths: &ReportPaths, fit: &ModelFit) -> Result<()> {
    let mut md = frontmatter(&[
        ("model", fit.name.clone()),
        ("family", family_label(fit.family).to_string()),
        ("observations", fit.observations.to_string()),
        ("dropped_columns", serde_json::to_string(&fit.dropped_columns)?),
    ])?;
    md.push_str(&format!("# {}\n\n", fit.name));
    md.push_str(&format!("> {}\n\n", fit.hypothesis));

    md.push_str("## Fit\n");
    md.push_str(&format!("- Family: {}\n", family_label(fit.family)));
    md.push_str(&format!("- Observations: {}\n", fit.observations));
    md.push_str(&format!("- Log-likelihood: {:.3}\n", fit.log_likelihood));
    md.push_str(&format!("- Deviance: {:.3}\n", fit.deviance));
    md.push_str(&format!("- AIC: {:.3}\n", fit.aic));
    md.push_str(&format!("- Iterations: {}\n\n", fit.iterations));

    md.push_str("## Coefficients\n\n");
    md.push_str("| Term | Estimate | Std. error | z | p | |\n|---|---|---|---|---|---|\n");
    for row in &fit.coefficients {
        md.push_str(&format!(
            "| {} | {:.4} | {:.4} | {} | {} | {} |\n",
            row.term,
            row.estimate,
            row.std_error,
            format_opt(row.z, 3),
            row.p_value.map_or_else(|| MISSING.to_string(), format_p),
            if row.significant { "*" } else { "" }
        ));
    }

    if let Some(re) = &fit.random_intercept {
        md.push_str("\n## Random intercept (legislator)\n");
        md.push_str(&format!("- Groups: {}\n", re.groups));
        md.push_str(&format!("- Variance: {:.4}\n", re.variance));
        md.push_str(&format!("- Std. dev.: {:.4}\n", re.std_dev));
    }

    if let Some(smooth) = &fit.smooth {
        md.push_str("\n## Smooth term\n");
        md.push_str(&format!("- Term: {}\n", smooth.term));
        md.push_str(&format!("- edf: {:.2}\n", smooth.edf));
        md.push_str(&format!("- lambda: {:.4}\n", smooth.lambda));
        md.push_str(&format!(
            "- chi-squared: {:.3} (p {}){}\n",
            smooth.chi_squared,
            format_p(smooth.p_value),
            if smooth.significant { " *" } else { "" }
        ));
    }

    if !fit.marginal.is_empty() {
        md.push_str("\n## Marginal probability of decline\n\n");
        md.push_str("| Cell | P(decline) | Std. error | 95% CI |\n|---|---|---|---|\n");
        for row in &fit.marginal {
            md.push_str(&format!(
                "| {} | {:.3} | {:.3} | [{:.3}, {:.3}] |\n",
                row.levels.join(", "),
                row.probability,
                row.std_error,
                row.lower,
                row.upper
            ));
        }
    }

    if !fit.dropped_columns.is_empty() {
        md.push_str("\n## Dropped columns\n");
        md.push_str("Columns with no observations in the data:\n");
        for column in &fit.dropped_columns {
            md.push_str(&format!("- `{column}`\n"));
        }
    }

    fs::write(paths.models_dir.join(format!("{}.md", fit.name)), md)?;
    Ok(())
}

fn write_robustness_note(paths: &ReportPaths, report: &RobustnessReport) -> Result<()> {
    let mut md = frontmatter(&[("kind", "robustness".to_string())])?;
    md.push_str("# Robustness\n\n");
    md.push_str(&format!("{GENERATED}\n\n"));

    md.push_str("## Random intercept likelihood-ratio tests\n\n");
    if report.likelihood_ratios.is_empty() {
        md.push_str("_No mixed model was available for comparison._\n");
    } else {
        md.push_str("| Model | Without intercept | Deviance diff. | df | p | |\n|---|---|---|---|---|---|\n");
        for lr in &report.likelihood_ratios {
            md.push_str(&format!(
                "| {} | {} | {:.3} | {} | {} | {} |\n",
                lr.model,
                lr.companion,
                lr.deviance_difference,
                lr.df,
                format_p(lr.p_value),
                if lr.significant { "*" } else { "" }
            ));
        }
    }
    for (model, error) in &report.skipped {
        md.push_str(&format!("- Skipped {model}: {error}\n"));
    }

    md.push_str("\n## Dispersion\n\n");
    if report.dispersion.is_empty() {
        md.push_str("_No fitted models._\n");
    } else {
        md.push_str("| Model | Pearson chi-squared | Residual df | Ratio | Overdispersed |\n|---|---|---|---|---|\n");
        for check in &report.dispersion {
            md.push_str(&format!(
                "| {} | {:.2} | {:.1} | {:.3} | {} |\n",
                check.model,
                check.pearson_chi_squared,
                check.residual_df,
                check.ratio,
                if check.overdispersed { "yes" } else { "no" }
            ));
        }
    }

    md.push_str("\n## Bootstrap\n\n");
    match &report.bootstrap {
        Some(boot) => push_bootstrap(&mut md, boot),
        None => md.push_str("_Bootstrap was not run._\n"),
    }

    fs::write(paths.robustness_dir.join("Robustness.md"), md)?;
    Ok(())
}

fn push_bootstrap(md: &mut String, boot: &BootstrapReport) {
    md.push_str(&format!("- Model: {}\n", boot.model));
    md.push_str(&format!(
        "- Replicates: {} requested, {} attempted, {} succeeded, {} failed\n",
        boot.requested, boot.attempted, boot.successful, boot.failed
    ));
    if boot.cancelled {
        md.push_str("- Cancelled before all replicates ran; results are partial.\n");
    }
    for message in &boot.failure_messages {
        md.push_str(&format!("  - {message}\n"));
    }
    if boot.successful == 0 || boot.coefficients.is_empty() {
        md.push_str("\n_No successful replicates._\n");
        return;
    }
    md.push_str("\n| Term | Original | Mean | Bias | Std. error | 95% percentile CI |\n|---|---|---|---|---|---|\n");
    for c in &boot.coefficients {
        md.push_str(&format!(
            "| {} | {:.4} | {} | {} | {} | [{}, {}] |\n",
            c.term,
            c.original,
            format_opt(c.mean, 4),
            format_opt(c.bias, 4),
            format_opt(c.std_error, 4),
            format_opt(c.lower, 4),
            format_opt(c.upper, 4)
        ));
    }
}

/// Rebuild `00_Index/MOC - Report.md` from the notes present on disk.
pub fn write_index(root: &Path) -> Result<()> {
    let paths = ReportPaths::new(root);
    paths.ensure()?;

    let mut lines = vec![
        "# MOC - Report".to_string(),
        String::new(),
        "This index is generated. Do not edit manually.".to_string(),
    ];
    for (title, dir) in [
        ("Classifiers", &paths.classifiers_dir),
        ("Models", &paths.models_dir),
        ("Robustness", &paths.robustness_dir),
    ] {
        lines.push(String::new());
        lines.push(format!("## {title}"));
        lines.push(String::new());
        let links = note_links(title, dir)?;
        if links.is_empty() {
            lines.push(format!("_No {} notes yet._", title.to_lowercase()));
        } else {
            lines.extend(links);
        }
    }

    fs::write(paths.index_dir.join("MOC - Report.md"), lines.join("\n"))?;
    Ok(())
}

fn note_links(prefix: &str, dir: &Path) -> Result<Vec<String>> {
    let mut links: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                return None;
            }
            let stem = path.file_stem()?.to_str()?.to_string();
            Some(format!("- [[{prefix}/{stem}|{stem}]]"))
        })
        .collect();
    links.sort();
    Ok(links)
}

fn frontmatter(fields: &[(&str, String)]) -> Result<String> {
    let generated_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut md = String::from("---\n");
    for (key, value) in fields {
        md.push_str(&format!("{key}: {value}\n"));
    }
    md.push_str(&format!("generated_at: {generated_at}\n"));
    md.push_str("---\n\n");
    Ok(md)
}

fn family_label(family: Family) -> &'static str {
    match family {
        Family::Logistic => "logistic",
        Family::MixedLogistic => "mixed logistic",
        Family::AdditiveLogistic => "additive logistic",
    }
}

/// Shown for statistics that could not be computed.
const MISSING: &str = "n/a";

fn format_opt(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| MISSING.to_string(), |v| format!("{v:.decimals$}"))
}

fn format_p(p: f64) -> String {
    if p < 0.001 {
        "<0.001".to_string()
    } else {
        format!("{p:.3}")
    }
}
