use crate::store::{MediaPatch, MetadataStore, VideoVariant};
use crate::variants::{is_mp4_content_type, rewrite_playlist};
use crate::walker::collect_posts;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// One intercepted network response, pushed from the page context.
///
/// How the stream is produced (DOM custom events, IPC, direct hooks) is the
/// collaborator's concern; tests feed synthetic events directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_status")]
    pub status: u16,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Structured-data payload walked; post records merged.
    Collected,
    /// Playback-config payload merged directly.
    PlaybackMerged,
    /// Path matched nothing we care about.
    Ignored,
    /// Matched path but absent/unparseable body or missing id; event dropped.
    Dropped,
}

fn structured_data_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:/i/api)?/graphql/[^/]+/(?:TweetDetail|TweetResultByRestId|UserTweets|UserMedia|HomeTimeline|HomeLatestTimeline|UserTweetsAndReplies|UserHighlightsTweets|UserArticlesTweets|Bookmarks|Likes|CommunitiesExploreTimeline|ListLatestTweetsTimeline)$",
        )
        .expect("structured data regex")
    })
}

fn playback_config_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // The segment can sit behind varying API prefixes; match it anywhere.
    RE.get_or_init(|| Regex::new(r"/videos?/tweet/config/").expect("playback config regex"))
}

/// Routes one intercepted response into the store.
///
/// Pure at-most-once processing: no retries, no suppression of duplicate
/// events (the merge semantics absorb those). A malformed body drops the
/// event and must never affect the next one.
pub fn ingest_event(store: &mut MetadataStore, event: &NetworkEvent) -> IngestOutcome {
    if structured_data_regex().is_match(&event.path) {
        let Some(body) = non_empty_body(event) else {
            return IngestOutcome::Dropped;
        };
        let Ok(json) = serde_json::from_str::<Value>(body) else {
            return IngestOutcome::Dropped;
        };
        collect_posts(store, &json);
        return IngestOutcome::Collected;
    }

    if playback_config_regex().is_match(&event.path) {
        let Some(body) = non_empty_body(event) else {
            return IngestOutcome::Dropped;
        };
        let Ok(config) = serde_json::from_str::<PlaybackConfigBody>(body) else {
            return IngestOutcome::Dropped;
        };
        return merge_playback_config(store, config);
    }

    IngestOutcome::Ignored
}

fn non_empty_body(event: &NetworkEvent) -> Option<&str> {
    event.body.as_deref().filter(|b| !b.is_empty())
}

// Playback config responses have a known flat shape; no walking needed.
// Field names vary across endpoint versions, hence the aliases and the
// untyped ids.
#[derive(Debug, Default, Deserialize)]
struct PlaybackConfigBody {
    #[serde(default)]
    track: Option<PlaybackTrack>,
    #[serde(default, alias = "tweetId")]
    tweet_id: Option<Value>,
    #[serde(default, alias = "playbackUrl")]
    playback_url: Option<String>,
    #[serde(default)]
    variants: Vec<RawPlaybackVariant>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaybackTrack {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "playbackUrl")]
    playback_url: Option<String>,
    #[serde(default)]
    variants: Vec<RawPlaybackVariant>,
    #[serde(default)]
    media: Option<PlaybackTrackMedia>,
    #[serde(default)]
    author: Option<PlaybackAuthor>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaybackTrackMedia {
    #[serde(default)]
    variants: Vec<RawPlaybackVariant>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaybackAuthor {
    #[serde(default)]
    screen_name: Option<String>,
    #[serde(default)]
    id_str: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawPlaybackVariant {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    bitrate: Option<u64>,
    #[serde(default)]
    content_type: Option<String>,
}

fn merge_playback_config(store: &mut MetadataStore, config: PlaybackConfigBody) -> IngestOutcome {
    let track = config.track.unwrap_or_default();

    let post_id = id_value_to_string(track.id.as_ref())
        .or_else(|| id_value_to_string(config.tweet_id.as_ref()));
    let Some(post_id) = post_id else {
        return IngestOutcome::Dropped;
    };

    let playback_url = track.playback_url.or(config.playback_url);

    let raw_variants = if !track.variants.is_empty() {
        track.variants
    } else if !config.variants.is_empty() {
        config.variants
    } else {
        track.media.map(|m| m.variants).unwrap_or_default()
    };

    let mut video_variants: Vec<VideoVariant> = Vec::new();
    for raw in raw_variants {
        let content_type = raw.content_type.unwrap_or_default();
        if !is_mp4_content_type(&content_type) {
            continue;
        }
        let Some(url) = raw.url.filter(|u| !u.is_empty()) else {
            continue;
        };
        video_variants.push(VideoVariant {
            url,
            bitrate: raw.bitrate,
            content_type,
        });
    }

    let rewritten_url = playback_url.as_deref().and_then(rewrite_playlist);
    if let Some(rewritten) = &rewritten_url {
        if !video_variants.iter().any(|v| v.url == *rewritten) {
            video_variants.push(VideoVariant {
                url: rewritten.clone(),
                bitrate: None,
                content_type: "video/mp4".to_string(),
            });
        }
    }

    let (screen_name, user_id) = match track.author {
        Some(author) => (author.screen_name, author.id_str),
        None => (None, None),
    };

    store.merge(
        &post_id,
        MediaPatch {
            screen_name,
            user_id,
            playback_url,
            rewritten_url,
            video_variants,
            ..Default::default()
        },
    );
    IngestOutcome::PlaybackMerged
}

fn id_value_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
