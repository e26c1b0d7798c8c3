use std::path::PathBuf;

use videokeep_engine::dispatch::{HttpDispatcher, SubmitOutcome, TaskDispatcher};
use videokeep_engine::events::{ingest_event, NetworkEvent};
use videokeep_engine::paths::AppPaths;
use videokeep_engine::reconcile::DownloadTask;
use videokeep_engine::scan::{run_feed_scan, ScanRequest};
use videokeep_engine::store::MetadataStore;
use videokeep_engine::{config, db};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut events_path: Option<PathBuf> = None;
    let mut page_path: Option<PathBuf> = None;
    let mut profile: Option<String> = None;
    let mut dispatch = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--events" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--events requires a value".to_string())?;
                events_path = Some(PathBuf::from(v));
            }
            "--page" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--page requires a value".to_string())?;
                page_path = Some(PathBuf::from(v));
            }
            "--profile" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--profile requires a value".to_string())?;
                profile = Some(v.trim_start_matches('@').to_string());
            }
            "--dispatch" => dispatch = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    if events_path.is_none() && page_path.is_none() {
        return Err("nothing to do (pass --events and/or --page)".to_string());
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;

    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    db::ensure_schema(&paths).map_err(|e| e.to_string())?;
    let settings = config::load_settings(&paths).map_err(|e| e.to_string())?;

    println!("Base dir: {}", paths.base_dir.to_string_lossy());

    let mut store = MetadataStore::new();

    if let Some(path) = &events_path {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let mut ingested = 0_usize;
        let mut skipped = 0_usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<NetworkEvent>(line) {
                Ok(event) => {
                    ingest_event(&mut store, &event);
                    ingested += 1;
                }
                Err(_) => skipped += 1,
            }
        }
        println!(
            "Events: {ingested} ingested, {skipped} skipped, {} posts collected",
            store.len()
        );
    }

    let Some(page_path) = page_path else {
        for post_id in store.post_ids() {
            let record = store.get(post_id);
            println!(
                "  {post_id}: {} video variant(s), {} image(s)",
                record.video_variants.len(),
                record.images.len()
            );
        }
        return Ok(());
    };

    let html = std::fs::read_to_string(&page_path).map_err(|e| e.to_string())?;
    let request = ScanRequest::new(html, profile, settings.filename_template.clone());

    let conn = db::open(&paths).map_err(|e| e.to_string())?;
    db::migrate(&conn).map_err(|e| e.to_string())?;

    let mut http_dispatcher;
    let mut dry_dispatcher = DryRunDispatcher;
    let dispatcher: &mut dyn TaskDispatcher = if dispatch {
        http_dispatcher = HttpDispatcher::new(&paths).map_err(|e| e.to_string())?;
        println!(
            "Downloads: {}",
            http_dispatcher.download_dir().to_string_lossy()
        );
        &mut http_dispatcher
    } else {
        println!("Dry run: tasks are listed, not downloaded (pass --dispatch)");
        &mut dry_dispatcher
    };

    let summary = run_feed_scan(
        &mut store,
        &conn,
        dispatcher,
        &request,
        Vec::new,
        || Ok(false),
        |_| Ok(()),
        |level, event, payload| {
            println!("[{level}] {event}: {payload}");
            Ok(())
        },
    )
    .map_err(|e| e.to_string())?;

    println!(
        "Scan: {} article(s), {} offered, {} dispatched, {} failed, {} already downloaded",
        summary.articles_seen,
        summary.posts_offered,
        summary.tasks_dispatched,
        summary.tasks_failed,
        summary.already_downloaded
    );
    Ok(())
}

struct DryRunDispatcher;

impl TaskDispatcher for DryRunDispatcher {
    fn submit(&mut self, task: &DownloadTask) -> SubmitOutcome {
        println!("  task: {} -> {}", task.url, task.filename);
        SubmitOutcome {
            url: task.url.clone(),
            filename: task.filename.clone(),
            ok: true,
            error: None,
        }
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("VIDEOKEEP_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("com.videokeep.videokeep"));
            }
        }
    }

    None
}

fn print_help() {
    println!(
        r#"videokeep_replay

Replays a captured network-event log (NDJSON) and/or a saved page snapshot
through the media pipeline: ingest, reconcile, dedupe, dispatch.

Usage:
  cargo run --bin videokeep_replay -- --events capture.ndjson
  cargo run --bin videokeep_replay -- --events capture.ndjson --page feed.html
  cargo run --bin videokeep_replay -- --events capture.ndjson --page feed.html --dispatch

Options:
  --base-dir <dir>   App data directory (default: $VIDEOKEEP_BASE_DIR)
  --events <file>    NDJSON file, one network event per line:
                     {{"path":"/graphql/q/UserTweets","body":"..."}}
  --page <file>      Saved HTML snapshot of the feed to reconcile against
  --profile <name>   Handle of the viewed profile (self-repost exception)
  --dispatch         Actually download; otherwise tasks are only listed
"#
    );
}
