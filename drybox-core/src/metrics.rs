//! Tabular metrics (`metrics.csv`) and structured event stream
//! (`events.jsonl`) writers.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::MetricsError;

pub const CSV_HEADER: [&str; 18] = [
    "t_ms",
    "side",
    "layer",
    "event",
    "rtt_ms_est",
    "latency_ms",
    "jitter_ms",
    "loss_rate",
    "reorder_rate",
    "goodput_bps",
    "snr_db_est",
    "ber",
    "per",
    "cfo_hz_est",
    "lock_ratio",
    "hs_time_ms",
    "rekey_ms",
    "aead_fail_cnt",
];

/// A single metrics row. Every numeric field beyond the first four is
/// optional; unset fields are written as empty cells.
#[derive(Debug, Clone, Default)]
pub struct MetricRow {
    pub t_ms: u64,
    pub side: String,
    pub layer: String,
    pub event: String,
    pub rtt_ms_est: Option<f64>,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub loss_rate: Option<f64>,
    pub reorder_rate: Option<f64>,
    pub goodput_bps: Option<f64>,
    pub snr_db_est: Option<f64>,
    pub ber: Option<f64>,
    pub per: Option<f64>,
    pub cfo_hz_est: Option<f64>,
    pub lock_ratio: Option<f64>,
    pub hs_time_ms: Option<f64>,
    pub rekey_ms: Option<f64>,
    pub aead_fail_cnt: Option<u64>,
}

fn fmt_opt(x: Option<f64>) -> String {
    match x {
        Some(v) => format!("{v:.6}"),
        None => String::new(),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
struct EventRecord {
    t_ms: u64,
    side: String,
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
}

pub struct MetricsWriter {
    csv: BufWriter<File>,
    events: BufWriter<File>,
    bytes_callback: Option<Box<dyn FnMut(&str, u64) + Send>>,
}

impl MetricsWriter {
    pub fn create(
        csv_path: impl AsRef<Path>,
        events_path: impl AsRef<Path>,
    ) -> Result<Self, MetricsError> {
        let mut csv = BufWriter::new(File::create(csv_path)?);
        writeln!(csv, "{}", CSV_HEADER.join(","))?;
        let events = BufWriter::new(File::create(events_path)?);
        Ok(Self {
            csv,
            events,
            bytes_callback: None,
        })
    }

    /// Register a callback invoked whenever an `event=demod` metric payload
    /// carries a `total_bytes_processed` field. Downstream consumers (e.g. a
    /// GUI) subscribe here rather than parsing `events.jsonl` themselves.
    pub fn set_bytes_callback(&mut self, callback: impl FnMut(&str, u64) + Send + 'static) {
        self.bytes_callback = Some(Box::new(callback));
    }

    pub fn write_metric(&mut self, row: &MetricRow) -> Result<(), MetricsError> {
        let fields = [
            row.t_ms.to_string(),
            csv_escape(&row.side),
            csv_escape(&row.layer),
            csv_escape(&row.event),
            fmt_opt(row.rtt_ms_est),
            fmt_opt(row.latency_ms),
            fmt_opt(row.jitter_ms),
            fmt_opt(row.loss_rate),
            fmt_opt(row.reorder_rate),
            fmt_opt(row.goodput_bps),
            fmt_opt(row.snr_db_est),
            fmt_opt(row.ber),
            fmt_opt(row.per),
            fmt_opt(row.cfo_hz_est),
            fmt_opt(row.lock_ratio),
            fmt_opt(row.hs_time_ms),
            fmt_opt(row.rekey_ms),
            row.aead_fail_cnt.map(|c| c.to_string()).unwrap_or_default(),
        ];
        writeln!(self.csv, "{}", fields.join(","))?;
        Ok(())
    }

    pub fn write_event(
        &mut self,
        t_ms: u64,
        side: &str,
        kind: &str,
        payload: Value,
    ) -> Result<(), MetricsError> {
        if kind == "metric" && payload.get("event").and_then(Value::as_str) == Some("demod") {
            if let Some(total_bytes) = payload.get("total_bytes_processed").and_then(Value::as_u64) {
                if let Some(cb) = self.bytes_callback.as_mut() {
                    cb(side, total_bytes);
                }
            }
        }

        let rec = EventRecord {
            t_ms,
            side: side.to_string(),
            kind: kind.to_string(),
            payload,
        };
        writeln!(self.events, "{}", serde_json::to_string(&rec)?)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), MetricsError> {
        self.csv.flush()?;
        self.events.flush()?;
        Ok(())
    }
}

/// Convenience constructor for a bearer-layer tx/rx/drop metrics row.
pub fn bearer_row(
    t_ms: u64,
    side: &str,
    event: &str,
    latency_ms: f64,
    jitter_ms: f64,
    loss_rate: f64,
    reorder_rate: f64,
) -> MetricRow {
    MetricRow {
        t_ms,
        side: side.to_string(),
        layer: "bearer".to_string(),
        event: event.to_string(),
        latency_ms: Some(latency_ms),
        jitter_ms: Some(jitter_ms),
        loss_rate: Some(loss_rate),
        reorder_rate: Some(reorder_rate),
        ..Default::default()
    }
}

/// JSON payload helper for a handshake/rekey event.
pub fn crypto_event_payload(key_id: &str, provenance: &str) -> Value {
    json!({ "key_id": key_id, "provenance": provenance })
}
