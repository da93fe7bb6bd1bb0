use crate::config::TopicConfig;
use crate::error::{PipelineError, Result};
use crate::schema::CleanPost;
use regex::{Regex, RegexBuilder};

/// Keeps posts whose text has a word containing the configured stem.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pattern: Regex,
}

impl TopicFilter {
    pub fn new(stem: &str, case_insensitive: bool) -> Result<Self> {
        let stem = stem.trim();
        if stem.is_empty() {
            return Err(PipelineError::Config("topic stem must not be empty".to_string()));
        }
        // \w* keeps the match inside a single word; a boundary only applies
        // on an edge where the stem itself starts or ends with a word character
        let lead = if stem.starts_with(is_word_char) { r"\b\w*" } else { "" };
        let tail = if stem.ends_with(is_word_char) { r"\w*\b" } else { "" };
        let pattern = RegexBuilder::new(&format!("{lead}{}{tail}", regex::escape(stem)))
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|err| PipelineError::Config(format!("invalid topic stem '{stem}': {err}")))?;
        Ok(Self { pattern })
    }

    pub fn from_config(config: &TopicConfig) -> Result<Self> {
        Self::new(&config.stem, config.case_insensitive)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn apply(&self, posts: Vec<CleanPost>) -> Vec<CleanPost> {
        let before = posts.len();
        let kept: Vec<CleanPost> = posts.into_iter().filter(|p| self.matches(&p.text)).collect();
        tracing::info!(before, after = kept.len(), pattern = %self.pattern, "topic filter applied");
        kept
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_words_containing_the_stem() {
        let filter = TopicFilter::new("abortion", true).unwrap();
        assert!(filter.matches("Protect abortion access now"));
        assert!(filter.matches("#AbortionRights are human rights"));
        assert!(filter.matches("anti-abortion extremists"));
        assert!(filter.matches("ABORTIONS"));
        assert!(!filter.matches("We passed the infrastructure bill"));
    }

    #[test]
    fn does_not_match_across_word_boundaries() {
        let filter = TopicFilter::new("abortion", true).unwrap();
        assert!(!filter.matches("abor tion"));
        assert!(!filter.matches("abor-tion"));
    }

    #[test]
    fn case_sensitivity_is_configurable() {
        let filter = TopicFilter::new("abortion", false).unwrap();
        assert!(filter.matches("abortion"));
        assert!(!filter.matches("Abortion"));
    }

    #[test]
    fn stem_is_escaped() {
        let filter = TopicFilter::new("roe.v", true).unwrap();
        assert!(!filter.matches("roexv"));
    }

    #[test]
    fn stems_with_non_word_edges_match() {
        let hashtag = TopicFilter::new("#roe", true).unwrap();
        assert!(hashtag.matches("#Roe"));
        assert!(hashtag.matches("Overturn #RoeVsWade today"));
        assert!(hashtag.matches("(#roe)"));
        assert!(!hashtag.matches("roe v wade"));

        let mention = TopicFilter::new("roe.", true).unwrap();
        assert!(mention.matches("after roe. the court"));
        assert!(mention.matches("overturning Roe."));
        assert!(!mention.matches("roe v wade"));
    }

    #[test]
    fn empty_stem_is_rejected() {
        assert!(TopicFilter::new("  ", true).is_err());
    }
}
