use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use threatline_config::{ConfigLoad, Settings, StoreBackend, StoreSettings, validation};
use threatline_core::adapters::{HttpInferenceAdapter, InMemoryRecordStore};
use threatline_core::telemetry::{FanoutSink, JsonlSink, TelemetryEmitter, TracingSink};
use threatline_core::{BatchCoordinator, IngestSummary, RecordId, RecordStore, RecordValidator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{CanonicalIdArgs, IngestArgs, ResumeArgs, input};

pub async fn ingest(load: ConfigLoad, args: IngestArgs) -> anyhow::Result<()> {
    let mut settings = load.settings;
    if let Some(backend) = args.store {
        settings.store.backend = backend;
    }
    if let Some(path) = args.events {
        settings.telemetry.jsonl_path = Some(path);
    }
    if let Some(batch_size) = args.batch_size {
        settings.pipeline.batch_size = batch_size;
    }
    if let Some(max_concurrency) = args.max_concurrency {
        settings.pipeline.max_concurrency = max_concurrency;
    }
    if args.no_inference {
        settings.inference.enabled = false;
    }
    validation::validate(&settings, true).context("invalid settings after CLI overrides")?;

    let skip = usize::try_from(args.start_offset).context("--start-offset is out of range")?;
    let records = input::open(&args.input, args.format).await?.skip(skip);
    let (coordinator, telemetry) = build(&settings).await?;
    let cancel = cancel_on_ctrl_c();

    info!(
        target: "threatline::cli",
        input = %args.input.display(),
        start_offset = args.start_offset,
        store = %settings.store.backend,
        inference = settings.inference.enabled,
        "ingest started"
    );
    let summary = coordinator
        .submit_from(args.start_offset, records, &cancel)
        .await;
    finish(&telemetry, &summary).await
}

pub async fn resume(load: ConfigLoad, args: ResumeArgs) -> anyhow::Result<()> {
    let mut settings = load.settings;
    if let Some(backend) = args.store {
        settings.store.backend = backend;
    }
    if let Some(path) = args.events {
        settings.telemetry.jsonl_path = Some(path);
    }
    validation::validate(&settings, true).context("invalid settings after CLI overrides")?;
    if settings.store.backend == StoreBackend::Memory {
        warn!(
            target: "threatline::cli",
            "resuming against the in-memory store; every id will be reported missing"
        );
    }

    let ids = read_ids(&args.ids).await?;
    let (coordinator, telemetry) = build(&settings).await?;
    let cancel = cancel_on_ctrl_c();

    let summary = coordinator.resume(stream::iter(ids), &cancel).await;
    finish(&telemetry, &summary).await
}

pub async fn check(load: ConfigLoad) -> anyhow::Result<()> {
    let store = open_store(&load.settings.store).await?;
    store
        .health_check()
        .await
        .context("record store health check failed")?;

    let mut settings = load.settings;
    if settings.store.database_url.is_some() {
        settings.store.database_url = Some("<redacted>".to_string());
    }
    let report = json!({
        "source": load.source.to_string(),
        "env_file_loaded": load.env_file_loaded,
        "store": "ok",
        "settings": settings,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// One JSON line per input record: `{"offset", "id"}` or `{"offset", "error"}`.
pub async fn canonical_id(load: ConfigLoad, args: CanonicalIdArgs) -> anyhow::Result<()> {
    let validator = RecordValidator::new(load.settings.pipeline.schema);
    let mut records = input::open(&args.input, args.format).await?;

    let mut offset = 0u64;
    while let Some(raw) = records.next().await {
        let line = match validator.validate(&raw) {
            Ok(record) => json!({ "offset": offset, "id": record.id }),
            Err(err) => json!({ "offset": offset, "error": err.to_string() }),
        };
        println!("{line}");
        offset += 1;
    }
    Ok(())
}

async fn build(settings: &Settings) -> anyhow::Result<(BatchCoordinator, TelemetryEmitter)> {
    let store = open_store(&settings.store).await?;

    let mut sink = FanoutSink::new(vec![Arc::new(TracingSink)]);
    if let Some(path) = &settings.telemetry.jsonl_path {
        let jsonl = JsonlSink::open(path)
            .await
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        sink.push(Arc::new(jsonl));
    }
    let telemetry = TelemetryEmitter::spawn(
        Arc::new(sink),
        settings.pipeline.telemetry.channel_capacity,
    );

    if !settings.inference.enabled {
        warn!(
            target: "threatline::cli",
            "inference disabled; records stay STORED until resumed"
        );
        let coordinator =
            BatchCoordinator::store_only(settings.pipeline.clone(), store, telemetry.clone())?;
        return Ok((coordinator, telemetry));
    }

    let inference_config = settings
        .http_inference()
        .context("inference.endpoint is not configured")?;
    let inference = HttpInferenceAdapter::new(inference_config)
        .context("failed to build the inference client")?;
    let coordinator = BatchCoordinator::new(
        settings.pipeline.clone(),
        store,
        Arc::new(inference),
        telemetry.clone(),
    )?;
    Ok((coordinator, telemetry))
}

async fn open_store(settings: &StoreSettings) -> anyhow::Result<Arc<dyn RecordStore>> {
    match settings.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryRecordStore::new())),
        StoreBackend::Postgres => open_postgres(settings).await,
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres(settings: &StoreSettings) -> anyhow::Result<Arc<dyn RecordStore>> {
    use threatline_core::adapters::PostgresRecordStore;

    let url = settings
        .database_url
        .as_deref()
        .context("store.database_url is not set")?;
    let store = PostgresRecordStore::connect(url, settings.max_connections)
        .await
        .context("failed to connect to postgres")?;
    store
        .bootstrap()
        .await
        .context("failed to prepare the records table")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_settings: &StoreSettings) -> anyhow::Result<Arc<dyn RecordStore>> {
    bail!("threatlinectl was built without the `postgres` feature")
}

async fn read_ids(path: &Path) -> anyhow::Result<Vec<RecordId>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut ids = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<RecordId>() {
            Ok(id) => ids.push(id),
            Err(err) => bail!("{}:{}: {}", path.display(), index + 1, err),
        }
    }
    Ok(ids)
}

async fn finish(telemetry: &TelemetryEmitter, summary: &IngestSummary) -> anyhow::Result<()> {
    telemetry.shutdown().await;
    if telemetry.dropped() > 0 {
        warn!(
            target: "threatline::cli",
            dropped = telemetry.dropped(),
            "telemetry events were dropped"
        );
    }
    if summary.cancelled {
        warn!(
            target: "threatline::cli",
            acknowledged_offset = summary.acknowledged_offset,
            "run cancelled; restart with --start-offset to continue"
        );
    }
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "threatline::cli", "interrupt received; finishing in-flight records");
            trigger.cancel();
        }
    });
    cancel
}
