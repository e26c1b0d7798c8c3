use crate::dispatch::TaskDispatcher;
use crate::events::{ingest_event, NetworkEvent};
use crate::history;
use crate::reconcile::{
    build_tasks, is_repost, is_self_repost, post_id_from_article, poster_track_ids,
    DownloadTask, OfferState, ReconcileContext, ARTICLE_SELECTOR,
};
use crate::retry::{RetryPolicy, BLOB_TRACK_POLICY};
use crate::store::MetadataStore;
use crate::Result;
use rusqlite::Connection;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub html: String,
    pub profile_handle: Option<String>,
    pub filename_template: String,
    /// Budget for waiting on late playback metadata of blob-backed players.
    pub track_policy: RetryPolicy,
}

impl ScanRequest {
    pub fn new(html: String, profile_handle: Option<String>, filename_template: String) -> Self {
        Self {
            html,
            profile_handle,
            filename_template,
            track_policy: BLOB_TRACK_POLICY,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanSummary {
    pub articles_seen: usize,
    pub without_post_id: usize,
    pub reposts_skipped: usize,
    pub already_downloaded: usize,
    pub posts_offered: usize,
    pub tasks_dispatched: usize,
    pub tasks_failed: usize,
    pub offer_states: HashMap<String, OfferState>,
}

/// Walks every rendered post in a captured page and drives each one through
/// the offer lifecycle: reconcile, history gate, dispatch, completion.
///
/// `pull_events` yields intercepted network responses that arrived since the
/// last call; they are ingested before each article and between retry probes
/// so late playback metadata can still attach to a blob-backed player.
pub fn run_feed_scan<FPullEvents, FShouldCancel, FSetProgress, FLog>(
    store: &mut MetadataStore,
    conn: &Connection,
    dispatcher: &mut dyn TaskDispatcher,
    request: &ScanRequest,
    mut pull_events: FPullEvents,
    mut should_cancel: FShouldCancel,
    mut set_progress: FSetProgress,
    mut log_line: FLog,
) -> Result<ScanSummary>
where
    FPullEvents: FnMut() -> Vec<NetworkEvent>,
    FShouldCancel: FnMut() -> Result<bool>,
    FSetProgress: FnMut(f32) -> Result<()>,
    FLog: FnMut(&str, &str, serde_json::Value) -> Result<()>,
{
    let document = Html::parse_document(&request.html);
    let article_sel = Selector::parse(ARTICLE_SELECTOR).expect("article selector");
    let articles: Vec<_> = document.select(&article_sel).collect();

    let mut summary = ScanSummary {
        articles_seen: articles.len(),
        ..Default::default()
    };

    // One batched history probe up front instead of a query per article.
    let mut page_post_ids: Vec<String> = Vec::new();
    for article in &articles {
        if let Some(id) = post_id_from_article(article) {
            if !page_post_ids.contains(&id) {
                page_post_ids.push(id);
            }
        }
    }
    let downloaded = history::exists_batch(conn, &page_post_ids)?;

    let total = articles.len().max(1);
    for (index, article) in articles.iter().enumerate() {
        if should_cancel()? {
            log_line(
                "info",
                "scan_cancelled",
                serde_json::json!({ "at_article": index }),
            )?;
            break;
        }
        set_progress(index as f32 / total as f32)?;

        for event in pull_events() {
            ingest_event(store, &event);
        }

        let Some(post_id) = post_id_from_article(article) else {
            summary.without_post_id += 1;
            continue;
        };

        if is_repost(article) && !is_self_repost(article, request.profile_handle.as_deref()) {
            summary.reposts_skipped += 1;
            continue;
        }

        // Same post rendered twice on one page is handled once.
        if summary.offer_states.contains_key(&post_id) {
            continue;
        }

        if downloaded.contains(&post_id) {
            summary
                .offer_states
                .insert(post_id.clone(), OfferState::Unseen.on_history_hit());
            summary.already_downloaded += 1;
            continue;
        }

        let mut tasks = {
            let ctx = ReconcileContext {
                store,
                profile_handle: request.profile_handle.as_deref(),
                filename_template: &request.filename_template,
            };
            build_tasks(article, &ctx)
        };

        // Blob-backed player with no metadata yet: wait briefly for the
        // playback config response to land.
        if tasks.is_empty() && !poster_track_ids(article).is_empty() {
            let polled: Option<Vec<DownloadTask>> = request.track_policy.poll(
                std::thread::sleep,
                || {
                    for event in pull_events() {
                        ingest_event(store, &event);
                    }
                    let ctx = ReconcileContext {
                        store,
                        profile_handle: request.profile_handle.as_deref(),
                        filename_template: &request.filename_template,
                    };
                    let rebuilt = build_tasks(article, &ctx);
                    if rebuilt.is_empty() {
                        None
                    } else {
                        Some(rebuilt)
                    }
                },
            );
            if let Some(rebuilt) = polled {
                tasks = rebuilt;
            }
        }

        if tasks.is_empty() {
            continue;
        }

        let mut state = OfferState::Unseen.on_tasks_found();
        summary.posts_offered += 1;
        log_line(
            "info",
            "post_offered",
            serde_json::json!({ "post_id": post_id, "tasks": tasks.len() }),
        )?;

        state = state.on_dispatch();
        let outcomes = dispatcher.submit_batch(&tasks);
        let failed = outcomes.iter().filter(|o| !o.ok).count();
        summary.tasks_dispatched += outcomes.len();
        summary.tasks_failed += failed;
        for outcome in &outcomes {
            if !outcome.ok {
                log_line(
                    "warn",
                    "task_failed",
                    serde_json::json!({
                        "post_id": post_id,
                        "url": outcome.url,
                        "error": outcome.error,
                    }),
                )?;
            }
        }
        if failed == 0 {
            state = state.on_batch_complete();
        }
        summary.offer_states.insert(post_id, state);
    }

    set_progress(1.0)?;
    log_line(
        "info",
        "scan_summary",
        serde_json::to_value(&summary).unwrap_or_default(),
    )?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::dispatch::SubmitOutcome;
    use crate::paths::AppPaths;
    use crate::store::{MediaPatch, VideoVariant};
    use std::time::Duration;

    struct FakeDispatcher {
        submitted: Vec<DownloadTask>,
        fail_all: bool,
    }

    impl FakeDispatcher {
        fn new() -> Self {
            Self {
                submitted: Vec::new(),
                fail_all: false,
            }
        }
    }

    impl TaskDispatcher for FakeDispatcher {
        fn submit(&mut self, task: &DownloadTask) -> SubmitOutcome {
            self.submitted.push(task.clone());
            SubmitOutcome {
                url: task.url.clone(),
                filename: task.filename.clone(),
                ok: !self.fail_all,
                error: self.fail_all.then(|| "refused".to_string()),
            }
        }
    }

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        let conn = db::open(&paths).expect("open");
        db::migrate(&conn).expect("migrate");
        (dir, conn)
    }

    fn quiet_scan(
        store: &mut MetadataStore,
        conn: &Connection,
        dispatcher: &mut FakeDispatcher,
        request: &ScanRequest,
        events: Vec<NetworkEvent>,
    ) -> ScanSummary {
        let mut pending = Some(events);
        run_feed_scan(
            store,
            conn,
            dispatcher,
            request,
            move || pending.take().unwrap_or_default(),
            || Ok(false),
            |_| Ok(()),
            |_, _, _| Ok(()),
        )
        .expect("scan")
    }

    fn request(html: &str) -> ScanRequest {
        ScanRequest {
            html: html.to_string(),
            profile_handle: None,
            filename_template: "{screen_name}_{post_id}".to_string(),
            track_policy: RetryPolicy::new(2, Duration::ZERO),
        }
    }

    const PAGE: &str = r#"
        <html><body>
          <article role="article">
            <a role="link" href="/alice/status/1"><time>t</time></a>
          </article>
          <article role="article">
            <a role="link" href="/alice/status/2"><time>t</time></a>
          </article>
          <article role="article">
            <p>no permalink here</p>
          </article>
        </body></html>"#;

    fn seed_video(store: &mut MetadataStore, post_id: &str, track: u64) {
        store.merge(
            post_id,
            MediaPatch {
                screen_name: Some("alice".to_string()),
                video_variants: vec![VideoVariant {
                    url: format!("https://v/ext_tw_video/{track}/pu/vid/1280x720/a.mp4"),
                    bitrate: Some(1_000_000),
                    content_type: "video/mp4".to_string(),
                }],
                ..Default::default()
            },
        );
    }

    #[test]
    fn scan_dispatches_known_posts_and_counts_the_rest() {
        let (_dir, conn) = test_conn();
        let mut store = MetadataStore::new();
        seed_video(&mut store, "1", 11);
        seed_video(&mut store, "2", 22);

        let mut dispatcher = FakeDispatcher::new();
        let summary = quiet_scan(&mut store, &conn, &mut dispatcher, &request(PAGE), Vec::new());

        assert_eq!(summary.articles_seen, 3);
        assert_eq!(summary.without_post_id, 1);
        assert_eq!(summary.posts_offered, 2);
        assert_eq!(summary.tasks_dispatched, 2);
        assert_eq!(summary.tasks_failed, 0);
        assert_eq!(summary.offer_states.get("1"), Some(&OfferState::Downloaded));
        assert_eq!(summary.offer_states.get("2"), Some(&OfferState::Downloaded));
        assert_eq!(dispatcher.submitted.len(), 2);
    }

    #[test]
    fn history_hit_short_circuits_to_downloaded() {
        let (_dir, conn) = test_conn();
        let record_id =
            history::record_queued(&conn, Some("1"), "https://v/a.mp4", "a.mp4").expect("queued");
        history::mark_complete(&conn, &record_id, Some("1"), None, None, 1, "ab")
            .expect("complete");

        let mut store = MetadataStore::new();
        seed_video(&mut store, "1", 11);
        seed_video(&mut store, "2", 22);

        let mut dispatcher = FakeDispatcher::new();
        let summary = quiet_scan(&mut store, &conn, &mut dispatcher, &request(PAGE), Vec::new());

        assert_eq!(summary.already_downloaded, 1);
        assert_eq!(summary.posts_offered, 1);
        assert_eq!(summary.offer_states.get("1"), Some(&OfferState::Downloaded));
        assert_eq!(dispatcher.submitted.len(), 1);
        assert_eq!(dispatcher.submitted[0].post_id.as_deref(), Some("2"));
    }

    #[test]
    fn failed_batch_leaves_state_downloading() {
        let (_dir, conn) = test_conn();
        let mut store = MetadataStore::new();
        seed_video(&mut store, "1", 11);

        let html = r#"<article role="article"><a href="/alice/status/1"><time>t</time></a></article>"#;
        let mut dispatcher = FakeDispatcher::new();
        dispatcher.fail_all = true;
        let summary = quiet_scan(&mut store, &conn, &mut dispatcher, &request(html), Vec::new());

        assert_eq!(summary.tasks_failed, 1);
        assert_eq!(
            summary.offer_states.get("1"),
            Some(&OfferState::Downloading)
        );
    }

    #[test]
    fn repost_articles_are_skipped() {
        let (_dir, conn) = test_conn();
        let mut store = MetadataStore::new();
        seed_video(&mut store, "1", 11);

        let html = r#"
            <article role="article">
              <a href="/bob"><span data-testid="socialContext">Bob reposted</span></a>
              <a href="/alice/status/1"><time>t</time></a>
            </article>"#;
        let mut dispatcher = FakeDispatcher::new();
        let summary = quiet_scan(&mut store, &conn, &mut dispatcher, &request(html), Vec::new());

        assert_eq!(summary.reposts_skipped, 1);
        assert!(dispatcher.submitted.is_empty());
    }

    #[test]
    fn late_playback_event_resolves_blob_player_within_retry_budget() {
        let (_dir, conn) = test_conn();
        let mut store = MetadataStore::new();

        let html = r#"
            <article role="article">
              <a href="/alice/status/5"><time>t</time></a>
              <video poster="https://img/ext_tw_video_thumb/321/pu/img/c.jpg" src="blob:x"></video>
            </article>"#;

        let config_body = r#"{
            "track": {
                "id": "5",
                "variants": [
                    {"url": "https://v/ext_tw_video/321/pu/vid/720x1280/b.mp4",
                     "bitrate": 1500000, "content_type": "video/mp4"}
                ]
            }
        }"#;
        let late_event = NetworkEvent {
            path: "/i/api/1.1/videos/tweet/config/5.json".to_string(),
            method: "GET".to_string(),
            body: Some(config_body.to_string()),
            status: 200,
        };

        // First pull returns nothing; the event only arrives during the
        // retry window.
        let mut pulls = 0;
        let mut dispatcher = FakeDispatcher::new();
        let summary = run_feed_scan(
            &mut store,
            &conn,
            &mut dispatcher,
            &request(html),
            move || {
                pulls += 1;
                if pulls == 2 {
                    vec![late_event.clone()]
                } else {
                    Vec::new()
                }
            },
            || Ok(false),
            |_| Ok(()),
            |_, _, _| Ok(()),
        )
        .expect("scan");

        assert_eq!(summary.posts_offered, 1);
        assert_eq!(dispatcher.submitted.len(), 1);
        assert_eq!(
            dispatcher.submitted[0].url,
            "https://v/ext_tw_video/321/pu/vid/720x1280/b.mp4"
        );
    }

    #[test]
    fn cancel_stops_before_dispatch() {
        let (_dir, conn) = test_conn();
        let mut store = MetadataStore::new();
        seed_video(&mut store, "1", 11);
        seed_video(&mut store, "2", 22);

        let mut dispatcher = FakeDispatcher::new();
        let summary = run_feed_scan(
            &mut store,
            &conn,
            &mut dispatcher,
            &request(PAGE),
            Vec::new,
            || Ok(true),
            |_| Ok(()),
            |_, _, _| Ok(()),
        )
        .expect("scan");

        assert_eq!(summary.posts_offered, 0);
        assert!(dispatcher.submitted.is_empty());
    }
}
