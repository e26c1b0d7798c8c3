use crate::store::VideoVariant;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use url::Url;

/// Quality folders tried when rewriting a playlist manifest into a direct
/// file URL, in descending preference order.
const PLAYLIST_QUALITIES: &[&str] = &[
    "1080x1920",
    "1920x1080",
    "1280x720",
    "720x1280",
    "720x720",
    "540x960",
    "480x852",
    "360x640",
    "320x568",
];

const PLAYLIST_FILENAME: &str = "playlist.m3u8";

fn track_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:ext_tw_video|amplify_video)/(\d+)").expect("track id regex"))
}

fn resolution_dir_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*/vid/)\d+x\d+/[^/]+$").expect("resolution dir regex"))
}

pub fn is_mp4_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("mp4")
}

pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

/// Grouping key asserting that two URLs encode the same underlying video.
///
/// Priority chain: numeric track id in the path, then the directory above a
/// `/vid/<W>x<H>/<file>` tail, then host + basename. URLs that do not parse
/// fall back to the literal string.
pub fn family_key(url: &str) -> String {
    let Ok(parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let path = parsed.path();

    if let Some(caps) = track_id_regex().captures(path) {
        return format!("id:{}", &caps[1]);
    }

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    if let Some(caps) = resolution_dir_regex().captures(path) {
        return format!("dir:{}{}", host, &caps[1]);
    }

    let basename = path.rsplit('/').next().unwrap_or_default();
    format!("{host}/{basename}")
}

/// Collapses observed variants to one URL per underlying video.
///
/// Within a family the highest-bitrate member wins (absent bitrate counts
/// as 0, ties keep the first-seen member). Winners are emitted in
/// descending-bitrate order, followed by `extras` (rewritten playlist URLs,
/// DOM-observed sources) in their original order, skipping any whose family
/// is already represented. Deduplication is always by family key, never by
/// literal URL equality.
pub fn dedupe(variants: &[VideoVariant], extras: &[String]) -> Vec<String> {
    let mut group_order: Vec<String> = Vec::new();
    let mut best: HashMap<String, &VideoVariant> = HashMap::new();

    for variant in variants {
        let key = family_key(&variant.url);
        match best.get(&key) {
            None => {
                group_order.push(key.clone());
                best.insert(key, variant);
            }
            Some(current) => {
                if variant.bitrate.unwrap_or(0) > current.bitrate.unwrap_or(0) {
                    best.insert(key, variant);
                }
            }
        }
    }

    let mut winners: Vec<&VideoVariant> = group_order
        .iter()
        .map(|key| best[key])
        .collect();
    // Stable sort: equal bitrates keep first-seen group order.
    winners.sort_by_key(|v| Reverse(v.bitrate.unwrap_or(0)));

    let mut emitted: HashSet<String> = group_order.into_iter().collect();
    let mut out: Vec<String> = winners.into_iter().map(|v| v.url.clone()).collect();

    for extra in extras {
        let key = family_key(extra);
        if emitted.insert(key) {
            out.push(extra.clone());
        }
    }

    out
}

/// Derives a direct-file URL from a streaming playlist URL.
///
/// Pure function: same input, same output. Returns `None` when the path
/// does not end in the playlist filename pattern or the URL fails to parse.
pub fn rewrite_playlist(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !parsed.path().ends_with(".m3u8") {
        return None;
    }

    let query = parsed
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let mut base = parsed.clone();
    base.set_query(None);
    base.set_fragment(None);
    let without_query = base.as_str().to_string();

    if let Some(dir) = without_query.strip_suffix(PLAYLIST_FILENAME) {
        for quality in PLAYLIST_QUALITIES {
            let candidate = format!("{dir}{quality}.mp4{query}");
            if candidate != url {
                return Some(candidate);
            }
        }
    }

    // Defensive fallback: substitute a name-derived file for the playlist.
    let name = parsed
        .query_pairs()
        .find(|(k, _)| k == "name")
        .map(|(_, v)| v.to_string())
        .unwrap_or_else(|| "video".to_string());
    Some(format!(
        "{}{query}",
        without_query.replace(PLAYLIST_FILENAME, &format!("{name}.mp4"))
    ))
}
