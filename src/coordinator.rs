//! Task Coordinator: state machine, per-layer sequencing, counter
//! aggregation and event emission.
//!
//! Grounded on `qt/src/Task.cpp` in full — `start`/`pause`/`resume`/`stop`,
//! `calculateTotalTiles`, `downloadTiles`'s count reconciliation, and
//! `processQueue`'s layer-transition logic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

use crate::config::Settings;
use crate::coord::TileCoord;
use crate::error::DownloadError;
use crate::events::Event;
use crate::fetch::{self, FetchContext};
use crate::geometry::Mask;
use crate::persistence::archive::derive_task_id;
use crate::persistence::{ProgressLedger, TileArchive};
use crate::planner::Layer;
use crate::tile::{Schema, TileFormat, TileSource};

/// Counters mutated by concurrent workers; all atomic, owned by the
/// coordinator for the life of a task (§3).
pub struct Counters {
    pub total_tiles: AtomicI64,
    pub current_progress: AtomicI64,
    pub downloaded_tiles: AtomicI64,
    pub layer_total: AtomicI64,
    pub layer_progress: AtomicI64,
}

impl Counters {
    pub fn new(total: i64) -> Self {
        Self {
            total_tiles: AtomicI64::new(total),
            current_progress: AtomicI64::new(0),
            downloaded_tiles: AtomicI64::new(0),
            layer_total: AtomicI64::new(0),
            layer_progress: AtomicI64::new(0),
        }
    }
}

/// The subset of lifecycle state the fetch pipeline needs to decide whether
/// to admit a tile. Broadcast via a `watch` channel to every in-flight
/// future (§5, §9: replaces the original's shared pending-reply map).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Full task lifecycle, `Idle -> Running -> (Paused <-> Running) -> (Stopped | Done)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Paused,
    Stopped,
    Done,
}

/// Build the layer list from configuration: one layer per zoom covered by
/// each `[[lrs]]` entry (falling back to the entry's own min/max, else the
/// tile map's global min/max), or a single unmasked sweep over
/// `tm.min..=tm.max` when no `[[lrs]]` entries are given at all.
async fn build_layers(settings: &Settings) -> Vec<Layer> {
    let mut layers = Vec::new();

    if settings.lrs.is_empty() {
        for z in settings.tm.min..=settings.tm.max {
            layers.push(Layer::new(z, Mask::empty()));
        }
        return layers;
    }

    for lrs in &settings.lrs {
        let min = lrs.min.unwrap_or(settings.tm.min);
        let max = lrs.max.unwrap_or(settings.tm.max);
        let mask = match &lrs.geojson {
            Some(path) if !path.is_empty() => Mask::load(Path::new(path)).await,
            _ => Mask::empty(),
        };
        for z in min..=max {
            let mut layer = Layer::new(z, mask.clone());
            layer.url_override = lrs.url.clone();
            layers.push(layer);
        }
    }
    layers
}

/// Candidates surviving archive/ledger filtering for one layer, plus how
/// many were skipped as already done — mirrors `Task::downloadTiles`'s
/// queue-building loop.
async fn plan_layer(
    layer: &Layer,
    archive: &TileArchive,
    ledger: Option<&ProgressLedger>,
    resume: bool,
    skip_existing: bool,
) -> (Vec<TileCoord>, i64) {
    let mut queue = Vec::new();
    let mut skipped = 0i64;

    for coord in layer.enumerate() {
        if resume {
            if let Some(ledger) = ledger {
                if ledger.is_done(coord).await.unwrap_or(false) {
                    skipped += 1;
                    continue;
                }
            }
        }

        if skip_existing {
            if archive.exists(coord).await.unwrap_or(false) {
                skipped += 1;
                if resume {
                    if let Some(ledger) = ledger {
                        let _ = ledger.mark(coord).await;
                    }
                }
                continue;
            }
        }

        queue.push(coord);
    }

    (queue, skipped)
}

/// Sum of per-layer upper-bound estimates for a configuration, without
/// opening the archive or ledger — used by the CLI's `--dry-run` mode so it
/// can report a plan without creating any output.
pub async fn estimate_total(settings: &Settings) -> i64 {
    build_layers(settings)
        .await
        .iter()
        .map(Layer::estimate)
        .sum()
}

/// Drives the whole download task: enumerate each layer, filter against
/// persistence, fan out to the fetch pipeline, aggregate progress.
pub struct Coordinator {
    settings: Settings,
    source: TileSource,
    layers: Vec<Layer>,
    archive: Arc<TileArchive>,
    ledger: Option<Arc<ProgressLedger>>,
    counters: Arc<Counters>,
    client: Client,
    events_tx: mpsc::UnboundedSender<Event>,
    run_state_tx: watch::Sender<RunState>,
    state: Mutex<TaskState>,
}

impl Coordinator {
    /// Build a coordinator from settings: opens the output archive and the
    /// progress ledger (if resume is enabled), but does not start fetching —
    /// that happens in [`Coordinator::run`], matching the `Idle -> start`
    /// transition of §4.6.
    pub async fn new(settings: Settings) -> Result<(Self, mpsc::UnboundedReceiver<Event>), DownloadError> {
        if settings.tm.url.is_empty() {
            return Err(DownloadError::MissingUrlTemplate);
        }

        let task_name = if settings.tm.name.is_empty() {
            "tiles".to_string()
        } else {
            settings.tm.name.clone()
        };
        let task_id = derive_task_id(&task_name, &settings.tm.url);

        let source = TileSource {
            url_template: settings.tm.url.clone(),
            schema: Schema::parse(&settings.tm.schema),
            format: TileFormat::parse(&settings.tm.format),
            name: task_name.clone(),
            description: settings.tm.description.clone(),
            min_zoom: settings.tm.min,
            max_zoom: settings.tm.max,
            json: settings.tm.json.clone(),
        };

        let output_dir = PathBuf::from(&settings.output.directory);
        let archive = if settings.output.format == "mbtiles" {
            let path = output_dir.join(format!("{task_name}.mbtiles"));
            TileArchive::open_mbtiles(
                &path,
                settings.task.skipexisting,
                &task_id,
                &task_name,
                &source.description,
                &source,
            )
            .await?
        } else {
            TileArchive::open_filesystem(&output_dir, &task_name, source.format.as_str()).await?
        };

        let ledger = if settings.task.resume {
            let path = crate::persistence::ledger::ledger_path(&output_dir, &task_name);
            Some(Arc::new(ProgressLedger::open(&path, true).await?))
        } else {
            let path = crate::persistence::ledger::ledger_path(&output_dir, &task_name);
            tokio::fs::remove_file(&path).await.ok();
            None
        };

        let layers = build_layers(&settings).await;
        let estimate: i64 = layers.iter().map(Layer::estimate).sum();

        let client = Client::builder()
            .user_agent(crate::fetch::USER_AGENT)
            .build()
            .map_err(DownloadError::Request)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (run_state_tx, _run_state_rx) = watch::channel(RunState::Running);

        let coordinator = Self {
            settings,
            source,
            layers,
            archive: Arc::new(archive),
            ledger,
            counters: Arc::new(Counters::new(estimate)),
            client,
            events_tx,
            run_state_tx,
            state: Mutex::new(TaskState::Idle),
        };

        Ok((coordinator, events_rx))
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    async fn wait_until_running_or_stopped(&self) -> bool {
        let mut rx = self.run_state_tx.subscribe();
        loop {
            match *rx.borrow() {
                RunState::Stopped => return false,
                RunState::Running => return true,
                RunState::Paused => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// `Idle -> Running`: compute estimates (already done in `new`), begin
    /// layer 0, drive every layer to completion in sequence, then
    /// `Running -> Done` on drain (or `-> Stopped` if `stop()` was called).
    pub async fn run(&self) -> Result<(), DownloadError> {
        *self.state.lock().await = TaskState::Running;
        let _ = self.events_tx.send(Event::StatusChanged {
            text: "Initializing...".to_string(),
        });
        let _ = self.events_tx.send(Event::StatusChanged {
            text: "Starting download...".to_string(),
        });

        for layer in &self.layers {
            if !self.wait_until_running_or_stopped().await {
                break;
            }

            let _ = self.events_tx.send(Event::StatusChanged {
                text: format!("Downloading zoom level {}...", layer.zoom),
            });

            let (queue, skipped) = plan_layer(
                layer,
                &self.archive,
                self.ledger.as_deref(),
                self.settings.task.resume,
                self.settings.task.skipexisting,
            )
            .await;

            let estimate = layer.estimate();
            let actual = queue.len() as i64 + skipped;
            self.counters
                .total_tiles
                .fetch_add(actual - estimate, Ordering::SeqCst);
            self.counters.layer_total.store(actual, Ordering::SeqCst);
            self.counters.layer_progress.store(skipped, Ordering::SeqCst);

            if skipped > 0 {
                let current = self
                    .counters
                    .current_progress
                    .fetch_add(skipped, Ordering::SeqCst)
                    + skipped;
                let total = self.counters.total_tiles.load(Ordering::SeqCst);
                let _ = self.events_tx.send(Event::ProgressUpdated { current, total });
            }

            let layer_total = self.counters.layer_total.load(Ordering::SeqCst);
            let _ = self.events_tx.send(Event::LayerProgressUpdated {
                zoom: layer.zoom,
                current: skipped,
                total: layer_total,
            });

            info!(zoom = layer.zoom, estimate, actual, skipped, queued = queue.len(), "planned layer");

            let ctx = FetchContext {
                client: self.client.clone(),
                archive: self.archive.clone(),
                ledger: self.ledger.clone(),
                events: self.events_tx.clone(),
                counters: self.counters.clone(),
                run_state: self.run_state_tx.subscribe(),
                time_delay_ms: self.settings.task.timedelay,
                skip_existing: self.settings.task.skipexisting,
            };

            fetch::run_layer(ctx, &self.source, layer.url_override.as_deref(), queue, self.settings.task.workers).await;

            // `actual` (queue + skipped), not `layer_progress` (skipped +
            // successfully fetched): a failed-transport or failed-persist
            // tile must not shrink the reported layer size (§4.5/§4.6).
            let final_count = self.counters.layer_total.load(Ordering::SeqCst);
            let _ = self.events_tx.send(Event::LayerCompleted {
                zoom: layer.zoom,
                count: final_count,
            });

            if *self.state.lock().await == TaskState::Stopped {
                break;
            }
        }

        let mut state = self.state.lock().await;
        if *state == TaskState::Stopped {
            let _ = self.events_tx.send(Event::StatusChanged {
                text: "Stopped".to_string(),
            });
        } else {
            *state = TaskState::Done;
            let _ = self.events_tx.send(Event::TaskCompleted);
            let _ = self.events_tx.send(Event::StatusChanged {
                text: "Task completed".to_string(),
            });
        }
        Ok(())
    }

    /// `Running -> Paused`: stop admitting new work; in-flight requests run
    /// to completion.
    pub async fn pause(&self) {
        *self.state.lock().await = TaskState::Paused;
        let _ = self.run_state_tx.send(RunState::Paused);
        let _ = self.events_tx.send(Event::StatusChanged {
            text: "Paused".to_string(),
        });
    }

    /// `Paused -> Running`: re-admit work.
    pub async fn resume(&self) {
        *self.state.lock().await = TaskState::Running;
        let _ = self.run_state_tx.send(RunState::Running);
        let _ = self.events_tx.send(Event::StatusChanged {
            text: "Resumed".to_string(),
        });
    }

    /// `(Running | Paused) -> Stopped`: stop admitting new work and drop the
    /// queue; in-flight requests still complete and may still be persisted.
    pub async fn stop(&self) {
        *self.state.lock().await = TaskState::Stopped;
        let _ = self.run_state_tx.send(RunState::Stopped);
        let _ = self.events_tx.send(Event::StatusChanged {
            text: "Stopped".to_string(),
        });
    }

    pub async fn state(&self) -> TaskState {
        *self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputConfig, Settings, TaskConfig, TileMapConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings_for(server_uri: &str, dir: &Path) -> Settings {
        Settings {
            app: Default::default(),
            log: Default::default(),
            output: OutputConfig {
                format: "files".to_string(),
                directory: dir.to_string_lossy().to_string(),
            },
            task: TaskConfig {
                workers: 2,
                timedelay: 0,
                skipexisting: false,
                resume: false,
            },
            tm: TileMapConfig {
                name: "t".to_string(),
                min: 0,
                max: 0,
                format: "png".to_string(),
                schema: "xyz".to_string(),
                json: None,
                url: format!("{server_uri}/{{z}}/{{x}}/{{y}}.png"),
            },
            lrs: vec![],
        }
    }

    #[tokio::test]
    async fn single_tile_end_to_end_scenario() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9, 9, 9]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(&server.uri(), dir.path());
        let (coordinator, mut events) = Coordinator::new(settings).await.unwrap();
        let counters = coordinator.counters();

        coordinator.run().await.unwrap();

        assert_eq!(counters.current_progress.load(Ordering::SeqCst), 1);
        assert_eq!(counters.total_tiles.load(Ordering::SeqCst), 1);
        assert_eq!(counters.downloaded_tiles.load(Ordering::SeqCst), 1);

        let expected_file = dir.path().join("t").join("0").join("0").join("0.png");
        assert!(tokio::fs::try_exists(&expected_file).await.unwrap());

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::TaskCompleted) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        assert_eq!(coordinator.state().await, TaskState::Done);
    }

    #[tokio::test]
    async fn missing_url_template_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for("http://unused", dir.path());
        settings.tm.url = String::new();
        assert!(Coordinator::new(settings).await.is_err());
    }

    const SQUARE_MASK: &str =
        r#"{"type":"Polygon","coordinates":[[[-10,-10],[10,-10],[10,10],[-10,10],[-10,-10]]]}"#;

    fn masked_settings(server_uri: &str, dir: &Path, geojson_path: &Path) -> Settings {
        let mut settings = settings_for(server_uri, dir);
        settings.output.format = "mbtiles".to_string();
        settings.lrs = vec![crate::config::LayerConfig {
            min: Some(2),
            max: Some(2),
            geojson: Some(geojson_path.to_string_lossy().to_string()),
            url: None,
        }];
        settings
    }

    /// Scenario 4 (§8): a tile already present in the archive is skipped
    /// under `skip_existing`, the other three candidates are fetched.
    #[tokio::test]
    async fn skip_existing_scenario_fetches_only_missing_tiles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mask_path = dir.path().join("mask.geojson");
        tokio::fs::write(&mask_path, SQUARE_MASK).await.unwrap();

        let mut settings = masked_settings(&server.uri(), dir.path(), &mask_path);
        settings.task.skipexisting = true;

        // Pre-populate the archive with one of the four candidates before the
        // task ever runs, the way a previous run (or a hand-seeded archive)
        // would have left it.
        let archive_path = dir.path().join("t.mbtiles");
        {
            let pre = TileArchive::open_mbtiles(
                &archive_path,
                true,
                "preexisting",
                "t",
                "",
                &TileSource {
                    url_template: settings.tm.url.clone(),
                    schema: Schema::Xyz,
                    format: TileFormat::Png,
                    name: "t".to_string(),
                    description: String::new(),
                    min_zoom: 2,
                    max_zoom: 2,
                    json: None,
                },
            )
            .await
            .unwrap();
            let mut tile = crate::tile::Tile::new(TileCoord::new(2, 1, 1));
            tile.bytes = Some(vec![0xAA]);
            pre.write(&tile, false).await.unwrap();
        }

        let (coordinator, _events) = Coordinator::new(settings).await.unwrap();
        let counters = coordinator.counters();
        coordinator.run().await.unwrap();

        assert_eq!(counters.downloaded_tiles.load(Ordering::SeqCst), 3);
        assert_eq!(counters.current_progress.load(Ordering::SeqCst), 4);
        assert_eq!(counters.total_tiles.load(Ordering::SeqCst), 4);
    }

    /// Scenario 3/idempotence (§8): a task run to completion with
    /// `resume=true`, then re-run against the same output, re-fetches nothing
    /// because the ledger already records every tile as done.
    #[tokio::test]
    async fn resume_scenario_second_run_skips_everything() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mask_path = dir.path().join("mask.geojson");
        tokio::fs::write(&mask_path, SQUARE_MASK).await.unwrap();

        let mut settings = masked_settings(&server.uri(), dir.path(), &mask_path);
        settings.task.resume = true;

        let (first, _events) = Coordinator::new(settings.clone()).await.unwrap();
        let first_counters = first.counters();
        first.run().await.unwrap();
        assert_eq!(first_counters.downloaded_tiles.load(Ordering::SeqCst), 4);

        let (second, _events) = Coordinator::new(settings).await.unwrap();
        let second_counters = second.counters();
        second.run().await.unwrap();

        assert_eq!(second_counters.downloaded_tiles.load(Ordering::SeqCst), 0);
        assert_eq!(second_counters.current_progress.load(Ordering::SeqCst), 4);
        assert_eq!(second_counters.total_tiles.load(Ordering::SeqCst), 4);
    }

    /// Scenario 6 (§8): one tile's origin returns a transport failure; the
    /// rest succeed, the task still completes, and the failing tile is
    /// neither counted nor persisted.
    #[tokio::test]
    async fn transport_failure_on_one_tile_still_completes_the_task() {
        let server = MockServer::start().await;
        // wiremock tries later-mounted mocks first, so the generic 200
        // responder is mounted before the specific 503 override below.
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1, 2, 3]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/1/0/0.png"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_for(&server.uri(), dir.path());
        settings.tm.min = 1;
        settings.tm.max = 1;

        let (coordinator, mut events) = Coordinator::new(settings).await.unwrap();
        let counters = coordinator.counters();
        coordinator.run().await.unwrap();

        assert_eq!(counters.downloaded_tiles.load(Ordering::SeqCst), 3);
        assert_eq!(counters.current_progress.load(Ordering::SeqCst), 3);

        let mut saw_error = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::ErrorOccurred { .. } => saw_error = true,
                Event::TaskCompleted => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(saw_completed);
        assert_eq!(coordinator.state().await, TaskState::Done);
    }
}
