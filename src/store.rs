use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One observed video encoding for a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoVariant {
    pub url: String,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Photo,
    AnimatedGif,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub url: String,
    pub kind: ImageKind,
    pub media_id: String,
}

/// Merged metadata for a single post, keyed by its platform id.
///
/// Records accumulate over a page session from partial, repeated
/// observations; they are never deleted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaMetadataRecord {
    pub post_id: String,
    pub created_at_ms: Option<i64>,
    pub screen_name: Option<String>,
    pub display_name: Option<String>,
    pub user_id: Option<String>,
    pub text: Option<String>,
    pub video_variants: Vec<VideoVariant>,
    pub images: Vec<ImageEntry>,
    pub playback_url: Option<String>,
    pub rewritten_url: Option<String>,
}

/// A partial observation to fold into the record for one post.
#[derive(Debug, Clone, Default)]
pub struct MediaPatch {
    pub created_at_ms: Option<i64>,
    pub screen_name: Option<String>,
    pub display_name: Option<String>,
    pub user_id: Option<String>,
    pub text: Option<String>,
    pub video_variants: Vec<VideoVariant>,
    pub images: Vec<ImageEntry>,
    pub playback_url: Option<String>,
    pub rewritten_url: Option<String>,
}

/// In-memory post-id -> metadata mapping for one page session.
///
/// Mutation happens through `merge` only. Not synchronized: callers on a
/// multithreaded runtime must wrap the store in a mutex, otherwise
/// concurrent merges lose updates on the variant/image unions.
#[derive(Debug, Default)]
pub struct MetadataStore {
    records: HashMap<String, MediaMetadataRecord>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `patch` into the record for `post_id`.
    ///
    /// Scalar fields are last-write-wins when the patch carries a value.
    /// `images` and `video_variants` are unions keyed by url, preserving
    /// first-seen order. For a repeated variant url the first occurrence
    /// wins: a later patch cannot replace its recorded bitrate. That keeps
    /// re-ingesting the same response a no-op.
    ///
    /// An empty `post_id` drops the patch.
    pub fn merge(&mut self, post_id: &str, patch: MediaPatch) {
        if post_id.is_empty() {
            return;
        }
        let record = self
            .records
            .entry(post_id.to_string())
            .or_insert_with(|| MediaMetadataRecord {
                post_id: post_id.to_string(),
                ..Default::default()
            });

        if patch.created_at_ms.is_some() {
            record.created_at_ms = patch.created_at_ms;
        }
        if patch.screen_name.is_some() {
            record.screen_name = patch.screen_name;
        }
        if patch.display_name.is_some() {
            record.display_name = patch.display_name;
        }
        if patch.user_id.is_some() {
            record.user_id = patch.user_id;
        }
        if patch.text.is_some() {
            record.text = patch.text;
        }
        if patch.playback_url.is_some() {
            record.playback_url = patch.playback_url;
        }
        if patch.rewritten_url.is_some() {
            record.rewritten_url = patch.rewritten_url;
        }

        for variant in patch.video_variants {
            if !record.video_variants.iter().any(|v| v.url == variant.url) {
                record.video_variants.push(variant);
            }
        }
        for image in patch.images {
            if !record.images.iter().any(|i| i.url == image.url) {
                record.images.push(image);
            }
        }
    }

    /// Returns the current record, or an empty record carrying only the id.
    pub fn get(&self, post_id: &str) -> MediaMetadataRecord {
        self.records
            .get(post_id)
            .cloned()
            .unwrap_or_else(|| MediaMetadataRecord {
                post_id: post_id.to_string(),
                ..Default::default()
            })
    }

    pub fn get_ref(&self, post_id: &str) -> Option<&MediaMetadataRecord> {
        self.records.get(post_id)
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.records.contains_key(post_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn post_ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &MediaMetadataRecord> {
        self.records.values()
    }
}
