//! Telemetry ingest.
//!
//! Keeps the latest sample per device. Samples are ordered by their own
//! timestamp when both sides carry one; otherwise arrival order wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::sanitizer::scan_payload;
use super::validation::{decode_payload, validate_payload};
use super::TelemetryError;
use crate::logging::structured::LogContext;
use crate::storage::{KeyedStore, TelemetrySample};

/// What happened to an accepted payload.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Now the device's latest sample.
    Stored(TelemetrySample),
    /// Valid but older than the stored sample; nothing written.
    Stale {
        device_id: String,
        stored_timestamp: DateTime<Utc>,
    },
}

impl IngestOutcome {
    pub fn device_id(&self) -> &str {
        match self {
            IngestOutcome::Stored(sample) => &sample.device_id,
            IngestOutcome::Stale { device_id, .. } => device_id,
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, IngestOutcome::Stored(_))
    }
}

/// Per-payload result of a batch.
#[derive(Debug)]
pub struct BatchIngestResult {
    pub received_count: usize,
    pub stored_count: usize,
    pub stale_count: usize,
    pub rejected_count: usize,
    pub results: Vec<Result<IngestOutcome, TelemetryError>>,
}

pub struct TelemetryIngest {
    store: Arc<KeyedStore<TelemetrySample>>,
}

impl TelemetryIngest {
    pub fn new(store: Arc<KeyedStore<TelemetrySample>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KeyedStore<TelemetrySample>> {
        &self.store
    }

    /// Validate and store one decoded payload.
    pub fn ingest(&self, payload: &Value) -> Result<IngestOutcome, TelemetryError> {
        self.accept(payload, LogContext::new("telemetry"))
    }

    /// Validate and store one raw JSON payload, decoding it once.
    pub fn ingest_json(&self, raw: &str) -> Result<IngestOutcome, TelemetryError> {
        let ctx = LogContext::new("telemetry");
        let payload = decode_payload(raw).map_err(|e| reject(&ctx, e))?;
        self.accept(&payload, ctx)
    }

    /// Ingest each payload independently; one bad payload never blocks the rest.
    pub fn ingest_batch(&self, payloads: &[Value]) -> BatchIngestResult {
        let results: Vec<_> = payloads.iter().map(|payload| self.ingest(payload)).collect();

        let stored_count = results.iter().filter(|r| matches!(r, Ok(o) if o.is_stored())).count();
        let stale_count = results.iter().filter(|r| matches!(r, Ok(o) if !o.is_stored())).count();
        let rejected_count = results.iter().filter(|r| r.is_err()).count();
        log::info!(
            "TELEMETRY_BATCH_COMPLETE received={} stored={} stale={} rejected={}",
            payloads.len(),
            stored_count,
            stale_count,
            rejected_count
        );

        BatchIngestResult {
            received_count: payloads.len(),
            stored_count,
            stale_count,
            rejected_count,
            results,
        }
    }

    pub fn latest(&self, device_id: &str) -> Option<TelemetrySample> {
        self.store.get(device_id)
    }

    pub fn snapshot(&self) -> BTreeMap<String, TelemetrySample> {
        self.store.snapshot()
    }

    fn accept(&self, payload: &Value, ctx: LogContext) -> Result<IngestOutcome, TelemetryError> {
        let sample = validate_payload(payload, Utc::now()).map_err(|e| reject(&ctx, e))?;
        let ctx = ctx.with_device(&sample.device_id);
        scan_payload(payload, &ctx);
        self.commit(sample, &ctx)
    }

    fn commit(&self, sample: TelemetrySample, ctx: &LogContext) -> Result<IngestOutcome, TelemetryError> {
        let device_id = sample.device_id.clone();
        let incoming = sample.timestamp;
        let record = sample.clone();
        let mut superseded_by: Option<DateTime<Utc>> = None;

        self.store.update(&device_id, |current| {
            let newer = current
                .and_then(|c| c.timestamp)
                .filter(|stored| incoming.map_or(false, |incoming| incoming < *stored));
            match newer {
                Some(stored) => {
                    superseded_by = Some(stored);
                    None
                }
                None => Some(sample),
            }
        })?;

        if let Some(stored_timestamp) = superseded_by {
            log::info!(
                "{} TELEMETRY_STALE timestamp={:?} stored_timestamp={}",
                ctx,
                incoming.map(|t| t.to_rfc3339()),
                stored_timestamp.to_rfc3339()
            );
            return Ok(IngestOutcome::Stale {
                device_id,
                stored_timestamp,
            });
        }

        log::info!(
            "{} TELEMETRY_STORED status={} sensors={}",
            ctx,
            record.status,
            record.sensors.as_ref().map_or(0, |s| s.len())
        );
        Ok(IngestOutcome::Stored(record))
    }
}

fn reject(ctx: &LogContext, e: TelemetryError) -> TelemetryError {
    log::warn!("{} TELEMETRY_REJECTED reason={} detail={}", ctx, e.reason_code(), e);
    e
}
