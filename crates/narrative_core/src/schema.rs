use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Date, Time};

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");
time::serde::format_description!(clock_time, Time, "[hour]:[minute]:[second]");

/// Engagement counters as reported by the source. `None` means not observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Engagement {
    pub reply_count: Option<u64>,
    pub repost_count: Option<u64>,
    pub like_count: Option<u64>,
    pub quote_count: Option<u64>,
}

/// A post exactly as retrieved, with the handle that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawPost {
    pub id: String,
    pub author_id: String,
    pub handle: String,       // provenance: the handle whose retrieval returned this post
    pub created_at: String,   // RFC 3339, as delivered by the source
    pub text: String,
    pub conversation_id: Option<String>,
    pub engagement: Option<Engagement>,
}

/// A post after the Cleaner: flat counters, split timestamp, derived ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CleanPost {
    pub id: String,
    pub author_id: String,
    pub handle: String,
    #[serde(with = "iso_date")]
    #[schemars(with = "String")]
    pub date: Date,
    #[serde(with = "clock_time")]
    #[schemars(with = "String")]
    pub time: Time,
    pub text: String,
    pub conversation_id: Option<String>,
    pub reply_count: Option<u64>,
    pub repost_count: Option<u64>,
    pub like_count: Option<u64>,
    pub quote_count: Option<u64>,
    pub reply_like_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String")]
pub enum Chamber {
    Senate,
    House,
}

impl FromStr for Chamber {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "senate" | "sen" | "senator" => Ok(Chamber::Senate),
            "house" | "rep" | "representative" => Ok(Chamber::House),
            other => Err(format!("unknown chamber: {other}")),
        }
    }
}

impl TryFrom<String> for Chamber {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String")]
pub enum Party {
    Democrat,
    Republican,
    Independent,
}

impl Party {
    /// Only the two major parties enter the regression models.
    pub fn is_major(self) -> bool {
        matches!(self, Party::Democrat | Party::Republican)
    }
}

impl FromStr for Party {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "d" | "dem" | "democrat" | "democratic" => Ok(Party::Democrat),
            "r" | "rep" | "gop" | "republican" => Ok(Party::Republican),
            "i" | "ind" | "independent" => Ok(Party::Independent),
            other => Err(format!("unknown party: {other}")),
        }
    }
}

impl TryFrom<String> for Party {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Party::Democrat => "Democrat",
            Party::Republican => "Republican",
            Party::Independent => "Independent",
        };
        write!(f, "{value}")
    }
}

/// One legislator. Reference data, loaded once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Politician {
    pub handle: String,
    pub name: String,
    pub chamber: Chamber,
    pub state: String, // postal code, e.g. "TX"
    pub party: Party,
}

/// The two narrative framings assigned to a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeLabel {
    Decline,
    Rising,
}

impl NarrativeLabel {
    pub const ALL: [NarrativeLabel; 2] = [NarrativeLabel::Decline, NarrativeLabel::Rising];

    pub fn as_str(self) -> &'static str {
        match self {
            NarrativeLabel::Decline => "decline",
            NarrativeLabel::Rising => "rising",
        }
    }

    pub fn other(self) -> Self {
        match self {
            NarrativeLabel::Decline => NarrativeLabel::Rising,
            NarrativeLabel::Rising => NarrativeLabel::Decline,
        }
    }
}

impl FromStr for NarrativeLabel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "decline" | "story of decline" => Ok(NarrativeLabel::Decline),
            "rising" | "story of rising" => Ok(NarrativeLabel::Rising),
            other => Err(format!("unknown narrative label: {other}")),
        }
    }
}

impl fmt::Display for NarrativeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A manually annotated post used for training and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LabeledExample {
    pub id: String,
    pub text: String,
    pub label: NarrativeLabel,
}

/// A topic-filtered post with its manual annotation (if any) and the
/// propagated prediction. The annotation is never overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LabeledPost {
    pub id: String,
    pub handle: String,
    #[serde(with = "iso_date")]
    #[schemars(with = "String")]
    pub date: Date,
    pub text: String,
    pub manual_label: Option<NarrativeLabel>,
    pub predicted_label: NarrativeLabel,
}

impl LabeledPost {
    pub fn effective_label(&self) -> NarrativeLabel {
        self.manual_label.unwrap_or(self.predicted_label)
    }
}

/// The fully joined row the regression models consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnalysisRecord {
    pub post_id: String,
    pub handle: String,
    pub legislator: usize, // group index for the random intercept
    pub legislator_name: String,
    #[serde(with = "iso_date")]
    #[schemars(with = "String")]
    pub date: Date,
    pub day: f64, // days since the earliest date in the set
    pub label: NarrativeLabel,
    pub party: Party,
    pub state: String,
    pub trigger_state: bool,
    pub post_ruling: bool,
    pub window: usize,
    pub window_name: String,
}

impl AnalysisRecord {
    /// Binary outcome of every model: 1 for a story of decline.
    pub fn outcome(&self) -> f64 {
        if self.label == NarrativeLabel::Decline { 1.0 } else { 0.0 }
    }
}
