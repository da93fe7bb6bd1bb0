use crate::error::{PipelineError, Result};
use crate::schema::{CleanPost, RawPost};
use std::cmp::Ordering;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// A post addressed to another account.
pub const REPLY_MARKER: &str = "@";
/// A repost of another account's post.
pub const REPOST_MARKER: &str = "RT @";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub input: usize,
    pub replies_dropped: usize,
    pub reposts_dropped: usize,
    pub output: usize,
}

pub fn is_reply(text: &str) -> bool {
    text.trim_start().starts_with(REPLY_MARKER)
}

pub fn is_repost(text: &str) -> bool {
    text.trim_start().starts_with(REPOST_MARKER)
}

/// Replies-to-likes; undefined when either count is missing (zero likes are
/// already recoded as missing).
pub fn reply_like_ratio(reply_count: Option<u64>, like_count: Option<u64>) -> Option<f64> {
    match (reply_count, like_count) {
        (Some(replies), Some(likes)) if likes > 0 => Some(replies as f64 / likes as f64),
        _ => None,
    }
}

fn nonzero(count: Option<u64>) -> Option<u64> {
    count.filter(|value| *value > 0)
}

/// Drop replies and reposts, flatten engagement, split timestamps, and order
/// by handle then descending reply-to-like ratio.
pub fn clean_posts(raw: Vec<RawPost>) -> Result<(Vec<CleanPost>, CleanSummary)> {
    let mut summary = CleanSummary {
        input: raw.len(),
        ..CleanSummary::default()
    };

    let mut cleaned = Vec::with_capacity(raw.len());
    for post in raw {
        if is_repost(&post.text) {
            summary.reposts_dropped += 1;
            continue;
        }
        if is_reply(&post.text) {
            summary.replies_dropped += 1;
            continue;
        }
        cleaned.push(clean_post(post)?);
    }

    // stable: ties keep retrieval order
    cleaned.sort_by(|a, b| a.handle.cmp(&b.handle).then_with(|| cmp_ratio_desc(a, b)));

    summary.output = cleaned.len();
    tracing::info!(
        input = summary.input,
        replies = summary.replies_dropped,
        reposts = summary.reposts_dropped,
        output = summary.output,
        "cleaned posts"
    );
    Ok((cleaned, summary))
}

fn cmp_ratio_desc(a: &CleanPost, b: &CleanPost) -> Ordering {
    match (a.reply_like_ratio, b.reply_like_ratio) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn clean_post(post: RawPost) -> Result<CleanPost> {
    let created = OffsetDateTime::parse(post.created_at.trim(), &Rfc3339)
        .map_err(|err| PipelineError::InvalidRecord {
            record: post.id.clone(),
            message: format!("unparseable created_at '{}': {err}", post.created_at),
        })?
        .to_offset(UtcOffset::UTC);

    let engagement = post.engagement.unwrap_or_default();
    let reply_count = nonzero(engagement.reply_count);
    let like_count = nonzero(engagement.like_count);

    Ok(CleanPost {
        id: post.id,
        author_id: post.author_id,
        handle: post.handle,
        date: created.date(),
        time: created.time().replace_nanosecond(0).unwrap_or(created.time()),
        text: post.text,
        conversation_id: post.conversation_id,
        reply_count,
        repost_count: nonzero(engagement.repost_count),
        like_count,
        quote_count: nonzero(engagement.quote_count),
        reply_like_ratio: reply_like_ratio(reply_count, like_count),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Engagement;
    use time::macros::{date, time};

    fn raw(id: &str, handle: &str, text: &str, replies: u64, likes: u64) -> RawPost {
        RawPost {
            id: id.to_string(),
            author_id: format!("author-{handle}"),
            handle: handle.to_string(),
            created_at: "2022-06-24T23:30:15.000Z".to_string(),
            text: text.to_string(),
            conversation_id: None,
            engagement: Some(Engagement {
                reply_count: Some(replies),
                repost_count: Some(0),
                like_count: Some(likes),
                quote_count: Some(1),
            }),
        }
    }

    #[test]
    fn replies_and_reposts_are_removed() {
        let input = vec![
            raw("1", "a", "@someone thanks", 1, 1),
            raw("2", "a", "RT @other: big news", 1, 1),
            raw("3", "a", "  @indented reply", 1, 1),
            raw("4", "a", "RTX is not a repost", 1, 1),
            raw("5", "a", "Our statement on the ruling", 1, 1),
        ];
        let (out, summary) = clean_posts(input).unwrap();
        let ids: Vec<&str> = out.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["4", "5"]);
        assert_eq!(summary.replies_dropped, 2);
        assert_eq!(summary.reposts_dropped, 1);
        for post in &out {
            assert!(!post.text.starts_with(REPLY_MARKER));
            assert!(!post.text.starts_with(REPOST_MARKER));
        }
    }

    #[test]
    fn zero_counts_become_missing_and_ratio_follows() {
        let (out, _) = clean_posts(vec![
            raw("1", "a", "no likes", 4, 0),
            raw("2", "a", "no replies", 0, 8),
            raw("3", "a", "both", 3, 12),
        ])
        .unwrap();
        let by_id = |id: &str| out.iter().find(|p| p.id == id).unwrap();

        let no_likes = by_id("1");
        assert_eq!(no_likes.like_count, None);
        assert_eq!(no_likes.reply_like_ratio, None);
        assert_eq!(no_likes.repost_count, None);

        let no_replies = by_id("2");
        assert_eq!(no_replies.reply_count, None);
        assert_eq!(no_replies.reply_like_ratio, None);

        let both = by_id("3");
        assert_eq!(both.reply_like_ratio, Some(3.0 / 12.0));
        assert_eq!(both.quote_count, Some(1));
    }

    #[test]
    fn missing_engagement_yields_missing_ratio() {
        let mut post = raw("1", "a", "text", 1, 1);
        post.engagement = None;
        let (out, _) = clean_posts(vec![post]).unwrap();
        assert_eq!(out[0].reply_count, None);
        assert_eq!(out[0].reply_like_ratio, None);
    }

    #[test]
    fn timestamp_is_split_into_utc_date_and_time() {
        let mut post = raw("1", "a", "text", 1, 1);
        post.created_at = "2022-06-24T20:30:15-05:00".to_string();
        let (out, _) = clean_posts(vec![post]).unwrap();
        assert_eq!(out[0].date, date!(2022 - 06 - 25));
        assert_eq!(out[0].time, time!(1:30:15));
    }

    #[test]
    fn ordering_groups_by_handle_then_ratio_desc_stably() {
        let (out, _) = clean_posts(vec![
            raw("b1", "bravo", "x", 1, 4),
            raw("a1", "alpha", "x", 1, 2),
            raw("a2", "alpha", "x", 0, 2),
            raw("a3", "alpha", "x", 3, 2),
            raw("a4", "alpha", "x", 1, 2),
            raw("b2", "bravo", "x", 2, 1),
        ])
        .unwrap();
        let ids: Vec<&str> = out.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a3", "a1", "a4", "a2", "b2", "b1"]);
    }

    #[test]
    fn malformed_timestamp_names_the_post() {
        let mut post = raw("bad-7", "a", "text", 1, 1);
        post.created_at = "yesterday".to_string();
        let err = clean_posts(vec![post]).unwrap_err();
        assert!(err.to_string().contains("bad-7"));
    }

    #[test]
    fn ratio_definition() {
        assert_eq!(reply_like_ratio(Some(5), Some(2)), Some(2.5));
        assert_eq!(reply_like_ratio(Some(5), Some(0)), None);
        assert_eq!(reply_like_ratio(Some(5), None), None);
        assert_eq!(reply_like_ratio(None, Some(3)), None);
    }
}
