use crate::error::{CollectError, Result};
use crate::types::parse_page;
use crate::{DateWindow, PostPage, PostSource};
use async_trait::async_trait;
use time::macros::format_description;
use time::Date;

pub const DEFAULT_BASE_URL: &str = "https://api.twitter.com/2";

const TWEET_FIELDS: &str = "created_at,public_metrics,conversation_id,author_id";

/// The endpoint rejects page sizes below this.
const MIN_RESULTS: u32 = 10;
const MAX_RESULTS: u32 = 500;

/// Full-archive search client.
pub struct SearchClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl SearchClient {
    pub fn new(token: String, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Read the bearer token from `bearer_env`.
    pub fn from_env(bearer_env: &str, base_url: impl Into<String>) -> Result<Self> {
        let token = std::env::var(bearer_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                CollectError::Auth(format!("environment variable {bearer_env} is not set"))
            })?;
        Ok(Self::new(token, base_url))
    }

    fn search_url(&self) -> String {
        format!("{}/tweets/search/all", self.base_url)
    }
}

/// Query pairs for one page. `end_time` is exclusive, so the closed window
/// ends at midnight after its last day.
pub fn search_params(
    handle: &str,
    window: &DateWindow,
    cursor: Option<&str>,
    max_results: u32,
) -> Result<Vec<(&'static str, String)>> {
    let end = window
        .end
        .next_day()
        .ok_or_else(|| CollectError::Parse(format!("end date {} has no successor", window.end)))?;
    let mut params = vec![
        ("query", format!("from:{}", handle.trim_start_matches('@'))),
        ("start_time", midnight(window.start)?),
        ("end_time", midnight(end)?),
        ("max_results", max_results.clamp(MIN_RESULTS, MAX_RESULTS).to_string()),
        ("tweet.fields", TWEET_FIELDS.to_string()),
    ];
    if let Some(token) = cursor {
        params.push(("next_token", token.to_string()));
    }
    Ok(params)
}

fn midnight(date: Date) -> Result<String> {
    let day = date
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| CollectError::Parse(err.to_string()))?;
    Ok(format!("{day}T00:00:00Z"))
}

#[async_trait]
impl PostSource for SearchClient {
    async fn fetch_page(
        &self,
        handle: &str,
        window: &DateWindow,
        cursor: Option<&str>,
        max_results: u32,
    ) -> Result<PostPage> {
        let params = search_params(handle, window, cursor, max_results)?;
        let resp = self
            .client
            .get(self.search_url())
            .bearer_auth(&self.token)
            .query(&params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CollectError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await?;
        let (posts, next_cursor) = parse_page(&body, handle)?;
        tracing::debug!(handle, posts = posts.len(), more = next_cursor.is_some(), "Fetched page");
        Ok(PostPage { posts, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn window() -> DateWindow {
        DateWindow {
            start: date!(2022 - 01 - 01),
            end: date!(2023 - 01 - 31),
        }
    }

    fn lookup<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn window_end_is_exclusive_midnight_of_next_day() {
        let params = search_params("@SenExample", &window(), None, 100).unwrap();
        assert_eq!(lookup(&params, "query"), Some("from:SenExample"));
        assert_eq!(lookup(&params, "start_time"), Some("2022-01-01T00:00:00Z"));
        assert_eq!(lookup(&params, "end_time"), Some("2023-02-01T00:00:00Z"));
        assert_eq!(lookup(&params, "max_results"), Some("100"));
        assert!(lookup(&params, "next_token").is_none());
    }

    #[test]
    fn cursor_and_page_floor_are_applied() {
        let params = search_params("RepX", &window(), Some("abc"), 3).unwrap();
        assert_eq!(lookup(&params, "next_token"), Some("abc"));
        assert_eq!(lookup(&params, "max_results"), Some("10"));
    }

    #[test]
    fn missing_credential_names_the_variable() {
        let var = "NARRATIVE_TEST_TOKEN_THAT_IS_NEVER_SET";
        let err = SearchClient::from_env(var, DEFAULT_BASE_URL).err().unwrap();
        assert!(matches!(err, CollectError::Auth(_)));
        assert!(err.to_string().contains(var));
    }
}
