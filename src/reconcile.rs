use crate::filename::{build_base_name, image_filename, video_filename};
use crate::store::{MetadataStore, VideoVariant};
use crate::variants::{dedupe, family_key, rewrite_playlist};
use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Selector matching one rendered post element.
pub const ARTICLE_SELECTOR: &str = r#"article[role="article"]"#;

const DOM_TEXT_EXCERPT_CHARS: usize = 30;

/// A finished download descriptor handed to the task dispatcher. Not
/// persisted by the reconciler itself.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub url: String,
    pub filename: String,
    pub post_id: Option<String>,
    pub screen_name: Option<String>,
    pub text: Option<String>,
    pub created_at_ms: Option<i64>,
}

/// Per-post lifecycle of the download affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    Unseen,
    Offered,
    Downloading,
    Downloaded,
}

impl OfferState {
    /// `unseen -> offered` once tasks exist for a newly scanned element.
    pub fn on_tasks_found(self) -> Self {
        match self {
            OfferState::Unseen => OfferState::Offered,
            other => other,
        }
    }

    /// `offered -> downloading` on dispatch.
    pub fn on_dispatch(self) -> Self {
        match self {
            OfferState::Offered => OfferState::Downloading,
            other => other,
        }
    }

    /// `downloading -> downloaded` once every task in the batch resolved.
    pub fn on_batch_complete(self) -> Self {
        match self {
            OfferState::Downloading => OfferState::Downloaded,
            other => other,
        }
    }

    /// A history hit short-circuits straight to `downloaded`, bypassing the
    /// offer/click path.
    pub fn on_history_hit(self) -> Self {
        OfferState::Downloaded
    }
}

#[derive(Debug)]
pub struct ReconcileContext<'a> {
    pub store: &'a MetadataStore,
    /// Handle of the currently-viewed profile, for the self-repost exception.
    pub profile_handle: Option<&'a str>,
    pub filename_template: &'a str,
}

fn status_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/status/(\d+)").expect("status id regex"))
}

fn poster_track_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:ext_tw_video_thumb|amplify_video_thumb)/(\d+)").expect("poster track regex")
    })
}

/// Resolves the post id of a rendered element.
///
/// Tries the most specific anchor first (the permalink wrapping the
/// timestamp), then a role-based link, then any status link, then a data
/// attribute. `None` is a valid terminal state: reposts of foreign content
/// and malformed markup are expected.
pub fn post_id_from_article(article: &ElementRef<'_>) -> Option<String> {
    let status_anchor = Selector::parse(r#"a[href*="/status/"]"#).expect("status anchor selector");
    let time_sel = Selector::parse("time").expect("time selector");

    for anchor in article.select(&status_anchor) {
        if anchor.select(&time_sel).next().is_some() {
            if let Some(id) = id_from_anchor(&anchor) {
                return Some(id);
            }
        }
    }

    let role_anchor =
        Selector::parse(r#"a[role="link"][href*="/status/"]"#).expect("role anchor selector");
    if let Some(id) = article.select(&role_anchor).find_map(|a| id_from_anchor(&a)) {
        return Some(id);
    }

    if let Some(id) = article.select(&status_anchor).find_map(|a| id_from_anchor(&a)) {
        return Some(id);
    }

    let data_attr = Selector::parse("[data-tweet-id]").expect("data attr selector");
    article
        .select(&data_attr)
        .find_map(|el| el.value().attr("data-tweet-id"))
        .map(str::to_string)
}

fn id_from_anchor(anchor: &ElementRef<'_>) -> Option<String> {
    let href = anchor.value().attr("href")?;
    status_id_regex()
        .captures(href)
        .map(|caps| caps[1].to_string())
}

/// Whether the element is a repost/boost of someone else's content.
pub fn is_repost(article: &ElementRef<'_>) -> bool {
    let social = Selector::parse(r#"[data-testid="socialContext"]"#).expect("social selector");
    article.select(&social).next().is_some()
}

/// The self-repost exception: the social-context marker links back to the
/// currently-viewed profile's own handle.
pub fn is_self_repost(article: &ElementRef<'_>, profile_handle: Option<&str>) -> bool {
    let Some(handle) = profile_handle.filter(|h| !h.is_empty()) else {
        return false;
    };
    let social = Selector::parse(r#"[data-testid="socialContext"]"#).expect("social selector");
    let anchor = Selector::parse("a[href]").expect("anchor selector");

    // The marker either sits inside a profile link or wraps one.
    for a in article.select(&anchor) {
        if a.select(&social).next().is_some() && anchor_is_profile(&a, handle) {
            return true;
        }
    }
    for marker in article.select(&social) {
        if marker.select(&anchor).any(|a| anchor_is_profile(&a, handle)) {
            return true;
        }
    }
    false
}

fn anchor_is_profile(anchor: &ElementRef<'_>, handle: &str) -> bool {
    let Some(href) = anchor.value().attr("href") else {
        return false;
    };
    href.trim_start_matches('/')
        .split('/')
        .next()
        .is_some_and(|segment| segment.eq_ignore_ascii_case(handle))
}

/// Scans the name block for `(display_name, handle)`.
pub fn names_from_article(article: &ElementRef<'_>) -> (Option<String>, Option<String>) {
    let block_sel = Selector::parse(r#"[data-testid="User-Name"]"#).expect("name block selector");
    let span_sel = Selector::parse("span").expect("span selector");

    let mut display_name: Option<String> = None;
    let mut handle: Option<String> = None;
    if let Some(block) = article.select(&block_sel).next() {
        for span in block.select(&span_sel) {
            if display_name.is_some() && handle.is_some() {
                break;
            }
            let text = span.text().collect::<String>().trim().to_string();
            if text.is_empty() {
                continue;
            }
            if let Some(stripped) = text.strip_prefix('@') {
                if handle.is_none() {
                    handle = Some(stripped.to_string());
                }
            } else if display_name.is_none() {
                display_name = Some(text);
            }
        }
    }
    (display_name, handle)
}

/// Visible text excerpt, possibly truncated relative to the payload text.
pub fn text_from_article(article: &ElementRef<'_>) -> Option<String> {
    let selectors = [r#"[data-testid="tweetText"]"#, "h1", "h2", "h3"];
    for raw in selectors {
        let sel = Selector::parse(raw).expect("text selector");
        if let Some(el) = article.select(&sel).next() {
            let text = el.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text.chars().take(DOM_TEXT_EXCERPT_CHARS).collect());
            }
        }
    }
    None
}

/// Direct-file video URLs rendered in the element.
///
/// Ephemeral blob/data URLs are useless outside the page and manifest URLs
/// are not downloadable as a single file; both are excluded.
pub fn video_urls_from_article(article: &ElementRef<'_>) -> Vec<String> {
    let sel = Selector::parse("video, source").expect("video selector");
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for el in article.select(&sel) {
        let Some(src) = el.value().attr("src") else {
            continue;
        };
        let url = src.trim();
        if url.is_empty() || !is_direct_video_url(url) {
            continue;
        }
        if seen.insert(url.to_string()) {
            out.push(url.to_string());
        }
    }
    out
}

fn is_direct_video_url(raw: &str) -> bool {
    if !raw.starts_with("http://") && !raw.starts_with("https://") {
        return false;
    }
    match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().ends_with(".mp4"),
        Err(_) => false,
    }
}

/// Post ids other than `own_id` referenced inside the element (quote posts,
/// embedded posts).
pub fn other_post_ids_in_article(article: &ElementRef<'_>, own_id: &str) -> Vec<String> {
    let sel = Selector::parse(r#"a[href*="/status/"]"#).expect("status anchor selector");
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for anchor in article.select(&sel) {
        if let Some(id) = id_from_anchor(&anchor) {
            if id != own_id && seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }
    out
}

/// Video track ids betrayed by poster/thumbnail image URLs. Blob-backed
/// players expose no source URL, but their poster names the track.
pub fn poster_track_ids(article: &ElementRef<'_>) -> Vec<String> {
    let sel = Selector::parse("img[src], video[poster]").expect("poster selector");
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for el in article.select(&sel) {
        let candidate = el
            .value()
            .attr("poster")
            .or_else(|| el.value().attr("src"))
            .unwrap_or_default();
        if let Some(caps) = poster_track_regex().captures(candidate) {
            let id = caps[1].to_string();
            if seen.insert(id.clone()) {
                out.push(id);
            }
        }
    }
    out
}

/// All stored variants whose family key names the given video track id,
/// regardless of which post they were recorded under.
pub fn variants_for_track_id(store: &MetadataStore, track_id: &str) -> Vec<VideoVariant> {
    let key = format!("id:{track_id}");
    let mut out: Vec<VideoVariant> = Vec::new();
    for record in store.records() {
        for variant in &record.video_variants {
            if family_key(&variant.url) == key && !out.iter().any(|v| v.url == variant.url) {
                out.push(variant.clone());
            }
        }
    }
    out
}

/// Builds the final, deduplicated task list for one rendered post element.
///
/// Empty output means "nothing to offer", not an error.
pub fn build_tasks(article: &ElementRef<'_>, ctx: &ReconcileContext<'_>) -> Vec<DownloadTask> {
    let Some(post_id) = post_id_from_article(article) else {
        return Vec::new();
    };

    if is_repost(article) && !is_self_repost(article, ctx.profile_handle) {
        return Vec::new();
    }

    // Stored metadata wins per-field; the DOM text may be visually truncated.
    let mut record = ctx.store.get(&post_id);
    let (display_name, handle) = names_from_article(article);
    if record.display_name.is_none() {
        record.display_name = display_name;
    }
    if record.screen_name.is_none() {
        record.screen_name = handle;
    }
    if record.text.is_none() {
        record.text = text_from_article(article);
    }

    let mut candidates: Vec<VideoVariant> = record.video_variants.clone();
    for other_id in other_post_ids_in_article(article, &post_id) {
        if let Some(other) = ctx.store.get_ref(&other_id) {
            for variant in &other.video_variants {
                if !candidates.iter().any(|v| v.url == variant.url) {
                    candidates.push(variant.clone());
                }
            }
        }
    }
    for track_id in poster_track_ids(article) {
        for variant in variants_for_track_id(ctx.store, &track_id) {
            if !candidates.iter().any(|v| v.url == variant.url) {
                candidates.push(variant);
            }
        }
    }

    let mut extras: Vec<String> = Vec::new();
    if let Some(rewritten) = &record.rewritten_url {
        extras.push(rewritten.clone());
    }
    if let Some(playback) = &record.playback_url {
        if let Some(rewritten) = rewrite_playlist(playback) {
            extras.push(rewritten);
        }
    }
    extras.extend(video_urls_from_article(article));

    let video_urls = dedupe(&candidates, &extras);
    let image_urls: Vec<String> = record.images.iter().map(|i| i.url.clone()).collect();

    if video_urls.is_empty() && image_urls.is_empty() {
        return Vec::new();
    }

    let base = build_base_name(ctx.filename_template, &record);
    let mut tasks: Vec<DownloadTask> = Vec::new();
    let video_total = video_urls.len();
    for (index, url) in video_urls.into_iter().enumerate() {
        tasks.push(DownloadTask {
            url,
            filename: video_filename(&base, index, video_total),
            post_id: Some(post_id.clone()),
            screen_name: record.screen_name.clone(),
            text: record.text.clone(),
            created_at_ms: record.created_at_ms,
        });
    }
    let image_total = image_urls.len();
    for (index, url) in image_urls.into_iter().enumerate() {
        tasks.push(DownloadTask {
            url,
            filename: image_filename(&base, index, image_total),
            post_id: Some(post_id.clone()),
            screen_name: record.screen_name.clone(),
            text: record.text.clone(),
            created_at_ms: record.created_at_ms,
        });
    }
    tasks
}
