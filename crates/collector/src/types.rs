//! Wire types of the full-archive search endpoint.

use crate::error::{CollectError, Result};
use narrative_core::schema::{Engagement, RawPost};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: Vec<Value>,
    pub meta: Option<SearchMeta>,
}

#[derive(Debug, Deserialize)]
pub struct SearchMeta {
    pub result_count: Option<u64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTweet {
    pub id: String,
    pub text: String,
    pub author_id: Option<String>,
    pub created_at: Option<String>,
    pub conversation_id: Option<String>,
    pub public_metrics: Option<PublicMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct PublicMetrics {
    pub reply_count: Option<u64>,
    pub retweet_count: Option<u64>,
    pub like_count: Option<u64>,
    pub quote_count: Option<u64>,
}

impl ApiTweet {
    /// Attach provenance (the handle searched) and keep the untouched JSON.
    pub fn into_raw(self, handle: &str) -> Result<RawPost> {
        let created_at = self
            .created_at
            .ok_or_else(|| CollectError::Parse(format!("post {} has no created_at", self.id)))?;
        Ok(RawPost {
            author_id: self.author_id.unwrap_or_default(),
            handle: handle.to_string(),
            created_at,
            text: self.text,
            conversation_id: self.conversation_id,
            engagement: self.public_metrics.map(|m| Engagement {
                reply_count: m.reply_count,
                repost_count: m.retweet_count,
                like_count: m.like_count,
                quote_count: m.quote_count,
            }),
            id: self.id,
        })
    }
}

/// Decode a response body into stored posts plus the next page token.
pub fn parse_page(body: &str, handle: &str) -> Result<(Vec<(RawPost, Value)>, Option<String>)> {
    let response: SearchResponse = serde_json::from_str(body)?;
    let mut posts = Vec::with_capacity(response.data.len());
    for raw in response.data {
        let tweet: ApiTweet = serde_json::from_value(raw.clone())?;
        posts.push((tweet.into_raw(handle)?, raw));
    }
    let next = response.meta.and_then(|m| m.next_token);
    Ok((posts, next))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
      "data": [
        {
          "id": "1550000000000000001",
          "text": "The ruling today is a dark day",
          "author_id": "99",
          "created_at": "2022-06-24T14:05:00.000Z",
          "conversation_id": "1550000000000000001",
          "public_metrics": {"retweet_count": 4, "reply_count": 12, "like_count": 40, "quote_count": 0}
        }
      ],
      "meta": {"result_count": 1, "next_token": "b26v89c19zqg8o3f"}
    }"#;

    #[test]
    fn parses_posts_with_provenance_and_token() {
        let (posts, next) = parse_page(PAGE, "SenExample").unwrap();
        assert_eq!(next.as_deref(), Some("b26v89c19zqg8o3f"));
        assert_eq!(posts.len(), 1);
        let (post, raw) = &posts[0];
        assert_eq!(post.handle, "SenExample");
        assert_eq!(post.created_at, "2022-06-24T14:05:00.000Z");
        let engagement = post.engagement.clone().unwrap();
        assert_eq!(engagement.repost_count, Some(4));
        assert_eq!(engagement.quote_count, Some(0));
        assert_eq!(raw["author_id"], "99");
    }

    #[test]
    fn empty_result_has_no_data_field() {
        let (posts, next) = parse_page(r#"{"meta": {"result_count": 0}}"#, "x").unwrap();
        assert!(posts.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn missing_timestamp_is_a_parse_error() {
        let body = r#"{"data": [{"id": "7", "text": "hi"}]}"#;
        assert!(matches!(parse_page(body, "x"), Err(CollectError::Parse(_))));
    }
}
