use crate::store::MediaMetadataRecord;
use chrono::{Local, TimeZone};
use uuid::Uuid;

/// Unambiguous charset for random filename tokens (no 0/O, 1/I/L, 6/9).
const RANDOM_CHARSET: &[u8] = b"ABCDEFGHJKMNPQRSTWXYZ2345678";
const MAX_COMPONENT_LEN: usize = 80;

pub fn sanitize_filename(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || ch.is_whitespace()
        {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    let collapsed = collapse_underscores(&out);
    collapsed.chars().take(MAX_COMPONENT_LEN).collect()
}

fn collapse_underscores(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_underscore = false;
    for ch in value.chars() {
        if ch == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(ch);
            last_was_underscore = false;
        }
    }
    out
}

pub fn random_token(len: usize) -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    bytes
        .iter()
        .cycle()
        .take(len)
        .map(|b| RANDOM_CHARSET[*b as usize % RANDOM_CHARSET.len()] as char)
        .collect()
}

pub fn format_post_time(ts_ms: i64) -> String {
    match Local.timestamp_millis_opt(ts_ms).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M").to_string(),
        None => String::new(),
    }
}

/// Expands the filename template against merged post metadata.
///
/// Returns a sanitized base name with no extension; callers append the
/// media extension and any index suffix.
pub fn build_base_name(template: &str, record: &MediaMetadataRecord) -> String {
    let post_time = record
        .created_at_ms
        .map(format_post_time)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format_post_time(now_ms()));

    let replacements: &[(&str, String)] = &[
        ("{screen_name}", record.screen_name.clone().unwrap_or_else(|| "user".to_string())),
        ("{username}", record.display_name.clone().unwrap_or_else(|| "user".to_string())),
        ("{user_id}", record.user_id.clone().unwrap_or_default()),
        ("{post_time}", post_time),
        ("{post_id}", if record.post_id.is_empty() { "post".to_string() } else { record.post_id.clone() }),
        ("{random}", random_token(6)),
        ("{text}", record.text.as_deref().unwrap_or_default().chars().take(30).collect()),
    ];

    let mut result = template.to_string();
    for (placeholder, value) in replacements {
        if result.contains(placeholder) {
            result = result.replace(placeholder, &sanitize_filename(value));
        }
    }

    let trimmed = collapse_underscores(&result)
        .trim_matches('_')
        .to_string();
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed
    }
}

/// `base.mp4` for a single video, `base_01.mp4`, `base_02.mp4`, … when a
/// post carries several.
pub fn video_filename(base: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        format!("{base}.mp4")
    } else {
        format!("{base}_{:02}.mp4", index + 1)
    }
}

pub fn image_filename(base: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        format!("{base}.jpg")
    } else {
        format!("{base}_{:02}.jpg", index + 1)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MediaMetadataRecord {
        MediaMetadataRecord {
            post_id: "42".to_string(),
            screen_name: Some("alice".to_string()),
            display_name: Some("Alice A".to_string()),
            user_id: Some("u1".to_string()),
            text: Some("hello world this is a fairly long post text".to_string()),
            created_at_ms: Some(1_539_202_764_000),
            ..Default::default()
        }
    }

    #[test]
    fn sanitize_replaces_reserved_and_collapses() {
        assert_eq!(sanitize_filename("a/b\\c:d*e"), "a_b_c_d_e");
        assert_eq!(sanitize_filename("a   b"), "a_b");
        assert_eq!(sanitize_filename("a___b"), "a_b");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_filename(&long).len(), MAX_COMPONENT_LEN);
    }

    #[test]
    fn base_name_substitutes_placeholders() {
        let base = build_base_name("{screen_name}_{post_id}", &record());
        assert_eq!(base, "alice_42");
    }

    #[test]
    fn base_name_truncates_text_placeholder() {
        let base = build_base_name("{text}", &record());
        assert!(base.chars().count() <= 30);
        assert!(base.starts_with("hello_world"));
    }

    #[test]
    fn base_name_never_empty() {
        let base = build_base_name("", &MediaMetadataRecord::default());
        assert_eq!(base, "video");
    }

    #[test]
    fn random_placeholder_expands_to_charset_token() {
        let base = build_base_name("{random}", &record());
        assert_eq!(base.len(), 6);
        assert!(base.bytes().all(|b| RANDOM_CHARSET.contains(&b)));
    }

    #[test]
    fn multi_file_suffixes_are_zero_padded() {
        assert_eq!(video_filename("base", 0, 1), "base.mp4");
        assert_eq!(video_filename("base", 0, 3), "base_01.mp4");
        assert_eq!(video_filename("base", 2, 3), "base_03.mp4");
        assert_eq!(image_filename("base", 1, 2), "base_02.jpg");
        assert_eq!(image_filename("base", 0, 1), "base.jpg");
    }
}
