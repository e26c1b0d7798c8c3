use crate::store::{ImageEntry, ImageKind, MediaPatch, MetadataStore, VideoVariant};
use crate::variants::is_mp4_content_type;
use chrono::DateTime;
use serde_json::Value;
use url::Url;

/// Timestamp format used by the platform, e.g. "Wed Oct 10 20:19:24 +0000 2018".
const PLATFORM_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Wrapper fields that are recursed into explicitly before the generic walk
/// continues; post containers hide behind them in newer payload versions.
const WRAPPER_FIELDS: &[&str] = &[
    "result",
    "tweet_results",
    "threaded_conversation_with_injections_v2",
];

/// Walks an arbitrary payload and merges every post-shaped substructure it
/// finds into the store.
///
/// The traversal is exhaustive: every object and array reachable from the
/// root is visited, because the position of post containers is not stable
/// across endpoint versions and a single timeline payload embeds many posts
/// at unrelated depths. Extraction never fails; nodes missing an id are
/// skipped.
pub fn collect_posts(store: &mut MetadataStore, value: &Value) {
    match value {
        Value::Object(map) => {
            try_collect_post_node(store, value);
            for child in map.values() {
                collect_posts(store, child);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_posts(store, item);
            }
        }
        _ => {}
    }
}

fn try_collect_post_node(store: &mut MetadataStore, node: &Value) {
    if !node.is_object() {
        return;
    }
    handle_post_container(store, node);
    if let Some(inner) = node.get("tweet") {
        handle_post_container(store, inner);
    }
    for field in WRAPPER_FIELDS {
        if let Some(inner) = node.get(*field) {
            try_collect_post_node(store, inner);
        }
    }
}

fn handle_post_container(store: &mut MetadataStore, container: &Value) {
    let legacy = container
        .get("legacy")
        .or_else(|| container.get("tweet").and_then(|t| t.get("legacy")))
        .unwrap_or(container);

    let Some(post_id) = post_id_of(container, legacy) else {
        return;
    };

    let created_at_ms = legacy
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(parse_platform_date);
    let text = legacy
        .get("full_text")
        .or_else(|| legacy.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let author = extract_author(container);
    let user_id = string_field(legacy, "user_id_str")
        .or_else(|| id_string(legacy.get("user_id")))
        .or(author.user_id);

    let media = legacy
        .get("extended_entities")
        .and_then(|e| e.get("media"))
        .or_else(|| legacy.get("entities").and_then(|e| e.get("media")))
        .and_then(Value::as_array);

    let mut images: Vec<ImageEntry> = Vec::new();
    let mut video_variants: Vec<VideoVariant> = Vec::new();
    if let Some(entries) = media {
        for entry in entries {
            collect_media_entry(entry, &mut images, &mut video_variants);
        }
    }

    store.merge(
        &post_id,
        MediaPatch {
            created_at_ms,
            screen_name: author.screen_name,
            display_name: author.display_name,
            user_id,
            text,
            video_variants,
            images,
            ..Default::default()
        },
    );
}

fn collect_media_entry(
    entry: &Value,
    images: &mut Vec<ImageEntry>,
    video_variants: &mut Vec<VideoVariant>,
) {
    let kind = match entry.get("type").and_then(Value::as_str) {
        Some("photo") => Some(ImageKind::Photo),
        Some("animated_gif") => Some(ImageKind::AnimatedGif),
        _ => None,
    };
    if let Some(kind) = kind {
        let url = entry
            .get("media_url_https")
            .or_else(|| entry.get("media_url"))
            .and_then(Value::as_str);
        if let Some(url) = url {
            images.push(ImageEntry {
                url: normalize_image_url(url),
                kind,
                media_id: string_field(entry, "id_str")
                    .or_else(|| id_string(entry.get("id")))
                    .unwrap_or_default(),
            });
        }
    }

    let variants = entry
        .get("video_info")
        .and_then(|vi| vi.get("variants"))
        .and_then(Value::as_array);
    if let Some(variants) = variants {
        for raw in variants {
            let content_type = raw
                .get("content_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            // Manifest-only renditions carry a non-mp4 content type.
            if !is_mp4_content_type(content_type) {
                continue;
            }
            let Some(url) = raw.get("url").and_then(Value::as_str) else {
                continue;
            };
            video_variants.push(VideoVariant {
                url: url.to_string(),
                bitrate: raw.get("bitrate").and_then(Value::as_u64),
                content_type: content_type.to_string(),
            });
        }
    }
}

#[derive(Debug, Default)]
struct AuthorInfo {
    screen_name: Option<String>,
    display_name: Option<String>,
    user_id: Option<String>,
}

/// Author extraction with the new-style-first fallback chain; the first
/// non-empty source wins per attribute.
fn extract_author(node: &Value) -> AuthorInfo {
    let user_result = node
        .get("core")
        .and_then(|c| c.get("user_results"))
        .and_then(|u| u.get("result"))
        .or_else(|| {
            node.get("core")
                .and_then(|c| c.get("user_result_by_id"))
                .and_then(|u| u.get("result"))
        })
        .or_else(|| node.get("author").and_then(|a| a.get("result")))
        .or_else(|| node.get("author"))
        .or_else(|| node.get("user_result").and_then(|u| u.get("result")));

    let legacy = user_result
        .and_then(|r| r.get("legacy"))
        .or_else(|| node.get("user").and_then(|u| u.get("legacy")))
        .or(user_result);
    let Some(legacy) = legacy else {
        return AuthorInfo::default();
    };

    AuthorInfo {
        screen_name: string_field(legacy, "screen_name")
            .or_else(|| string_field(legacy, "username")),
        display_name: string_field(legacy, "name"),
        user_id: string_field(legacy, "id_str")
            .or_else(|| id_string(legacy.get("id")))
            .or_else(|| user_result.and_then(|r| string_field(r, "rest_id"))),
    }
}

fn post_id_of(container: &Value, legacy: &Value) -> Option<String> {
    string_field(container, "rest_id")
        .or_else(|| {
            container
                .get("tweet")
                .and_then(|t| string_field(t, "rest_id"))
        })
        .or_else(|| string_field(legacy, "id_str"))
        .or_else(|| id_string(legacy.get("id")))
}

fn string_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_platform_date(raw: &str) -> Option<i64> {
    DateTime::parse_from_str(raw, PLATFORM_DATE_FORMAT)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Rewrites an image URL to request the largest available rendition.
///
/// URLs addressed by `name` query parameter get `name=orig`; otherwise the
/// trailing `:size` qualifier is replaced (or appended) with `:orig`.
pub fn normalize_image_url(raw: &str) -> String {
    if let Ok(parsed) = Url::parse(raw) {
        if parsed.query_pairs().any(|(k, _)| k == "name") {
            let mut rewritten = parsed.clone();
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    let v = if k == "name" { "orig".to_string() } else { v.into_owned() };
                    (k.into_owned(), v)
                })
                .collect();
            rewritten
                .query_pairs_mut()
                .clear()
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            return rewritten.to_string();
        }
    }

    let (base, query) = match raw.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (raw, None),
    };
    let stripped = match base.rfind(':') {
        // Keep the scheme separator; only strip a size suffix after the
        // last path segment's extension.
        Some(idx) if idx > base.rfind('/').unwrap_or(0) => &base[..idx],
        _ => base,
    };
    match query {
        Some(query) => format!("{stripped}:orig?{query}"),
        None => format!("{stripped}:orig"),
    }
}
