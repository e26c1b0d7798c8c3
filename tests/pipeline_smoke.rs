use videokeep_engine::dispatch::{SubmitOutcome, TaskDispatcher};
use videokeep_engine::events::{ingest_event, IngestOutcome, NetworkEvent};
use videokeep_engine::history;
use videokeep_engine::paths::AppPaths;
use videokeep_engine::reconcile::DownloadTask;
use videokeep_engine::scan::{run_feed_scan, ScanRequest};
use videokeep_engine::store::MetadataStore;
use videokeep_engine::{config, db};

struct CapturingDispatcher {
    conn: rusqlite::Connection,
    submitted: Vec<DownloadTask>,
}

// Records to the real database but skips the network transfer, so the
// whole pipeline runs offline.
impl TaskDispatcher for CapturingDispatcher {
    fn submit(&mut self, task: &DownloadTask) -> SubmitOutcome {
        let record_id = history::record_queued(
            &self.conn,
            task.post_id.as_deref(),
            &task.url,
            &task.filename,
        )
        .expect("record queued");
        history::mark_complete(
            &self.conn,
            &record_id,
            task.post_id.as_deref(),
            task.screen_name.as_deref(),
            task.text.as_deref(),
            2048,
            "cafef00d",
        )
        .expect("mark complete");
        self.submitted.push(task.clone());
        SubmitOutcome {
            url: task.url.clone(),
            filename: task.filename.clone(),
            ok: true,
            error: None,
        }
    }
}

fn timeline_event() -> NetworkEvent {
    let body = serde_json::json!({
        "data": {
            "user": {
                "timeline": {
                    "entries": [
                        {
                            "content": {
                                "tweet_results": {
                                    "result": {
                                        "rest_id": "1001",
                                        "core": {
                                            "user_results": {
                                                "result": {
                                                    "rest_id": "u1",
                                                    "legacy": {
                                                        "screen_name": "alice",
                                                        "name": "Alice A"
                                                    }
                                                }
                                            }
                                        },
                                        "legacy": {
                                            "id_str": "1001",
                                            "full_text": "clip of the day",
                                            "created_at": "Wed Oct 10 20:19:24 +0000 2018",
                                            "extended_entities": {
                                                "media": [
                                                    {
                                                        "type": "video",
                                                        "id_str": "m1",
                                                        "video_info": {
                                                            "variants": [
                                                                {
                                                                    "url": "https://v/ext_tw_video/555/pu/vid/1280x720/hi.mp4",
                                                                    "bitrate": 2_000_000,
                                                                    "content_type": "video/mp4"
                                                                },
                                                                {
                                                                    "url": "https://v/ext_tw_video/555/pu/vid/480x852/lo.mp4",
                                                                    "bitrate": 500_000,
                                                                    "content_type": "video/mp4"
                                                                },
                                                                {
                                                                    "url": "https://v/ext_tw_video/555/pu/pl/playlist.m3u8",
                                                                    "content_type": "application/x-mpegURL"
                                                                }
                                                            ]
                                                        }
                                                    }
                                                ]
                                            }
                                        }
                                    }
                                }
                            }
                        },
                        {
                            "content": {
                                "tweet_results": {
                                    "result": {
                                        "rest_id": "1002",
                                        "legacy": {
                                            "id_str": "1002",
                                            "full_text": "two photos",
                                            "extended_entities": {
                                                "media": [
                                                    {
                                                        "type": "photo",
                                                        "id_str": "m2",
                                                        "media_url_https": "https://img/p1.jpg"
                                                    },
                                                    {
                                                        "type": "photo",
                                                        "id_str": "m3",
                                                        "media_url_https": "https://img/p2.jpg"
                                                    }
                                                ]
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    ]
                }
            }
        }
    });
    NetworkEvent {
        path: "/i/api/graphql/AbCd123/UserMedia".to_string(),
        method: "GET".to_string(),
        body: Some(body.to_string()),
        status: 200,
    }
}

const FEED_HTML: &str = r#"
    <html><body>
      <article role="article">
        <div data-testid="User-Name"><span>Alice A</span><span>@alice</span></div>
        <a role="link" href="/alice/status/1001"><time datetime="2018-10-10">Oct 10</time></a>
        <div data-testid="tweetText">clip of the day</div>
      </article>
      <article role="article">
        <a role="link" href="/alice/status/1002"><time>t</time></a>
      </article>
      <article role="article">
        <a href="/bob"><span data-testid="socialContext">Bob reposted</span></a>
        <a role="link" href="/carol/status/1003"><time>t</time></a>
      </article>
    </body></html>"#;

#[test]
fn ingest_reconcile_dispatch_history_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = AppPaths::new(dir.path().to_path_buf());
    paths.ensure_dirs().expect("ensure dirs");
    db::ensure_schema(&paths).expect("schema");
    let settings = config::load_settings(&paths).expect("settings");

    let mut store = MetadataStore::new();
    assert_eq!(
        ingest_event(&mut store, &timeline_event()),
        IngestOutcome::Collected
    );
    // The exhaustive walk also records id-bearing auxiliary nodes (the
    // user result, each media entry) under their own ids; those never
    // match a rendered permalink, so only the post ids matter downstream.
    assert!(store.contains("1001"));
    assert!(store.contains("1002"));
    assert!(store.contains("u1"));

    let record = store.get("1001");
    assert_eq!(record.screen_name.as_deref(), Some("alice"));
    assert_eq!(record.created_at_ms, Some(1_539_202_764_000));
    // Manifest variant filtered at ingest.
    assert_eq!(record.video_variants.len(), 2);

    let conn = db::open(&paths).expect("open");
    db::migrate(&conn).expect("migrate");
    let mut dispatcher = CapturingDispatcher {
        conn: db::open(&paths).expect("open dispatcher conn"),
        submitted: Vec::new(),
    };

    let request = ScanRequest::new(
        FEED_HTML.to_string(),
        Some("alice".to_string()),
        settings.filename_template.clone(),
    );
    let summary = run_feed_scan(
        &mut store,
        &conn,
        &mut dispatcher,
        &request,
        Vec::new,
        || Ok(false),
        |_| Ok(()),
        |_, _, _| Ok(()),
    )
    .expect("scan");

    assert_eq!(summary.articles_seen, 3);
    assert_eq!(summary.reposts_skipped, 1);
    assert_eq!(summary.posts_offered, 2);
    // One deduped video for 1001, two photos for 1002.
    assert_eq!(summary.tasks_dispatched, 3);
    assert_eq!(summary.tasks_failed, 0);

    let video_task = dispatcher
        .submitted
        .iter()
        .find(|t| t.post_id.as_deref() == Some("1001"))
        .expect("video task");
    assert_eq!(
        video_task.url,
        "https://v/ext_tw_video/555/pu/vid/1280x720/hi.mp4"
    );
    assert!(video_task.filename.ends_with(".mp4"));
    assert!(video_task.filename.contains("alice"));

    let photo_names: Vec<&str> = dispatcher
        .submitted
        .iter()
        .filter(|t| t.post_id.as_deref() == Some("1002"))
        .map(|t| t.filename.as_str())
        .collect();
    assert_eq!(photo_names.len(), 2);
    assert!(photo_names[0].ends_with("_01.jpg"));
    assert!(photo_names[1].ends_with("_02.jpg"));

    // Completed posts are now history; a second pass offers nothing.
    assert!(history::exists(&conn, "1001").expect("exists"));
    assert!(history::exists(&conn, "1002").expect("exists"));

    let rescan = run_feed_scan(
        &mut store,
        &conn,
        &mut dispatcher,
        &request,
        Vec::new,
        || Ok(false),
        |_| Ok(()),
        |_, _, _| Ok(()),
    )
    .expect("rescan");
    assert_eq!(rescan.posts_offered, 0);
    assert_eq!(rescan.already_downloaded, 2);
    assert_eq!(dispatcher.submitted.len(), 3);
}
