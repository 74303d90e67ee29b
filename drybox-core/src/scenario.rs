//! Scenario document loading, validation, and sweep expansion.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;

use crate::errors::ScenarioError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BearerConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub latency_ms: Option<i64>,
    pub mtu_bytes: Option<i64>,
    pub jitter_ms: Option<i64>,
    pub loss_rate: Option<f64>,
    pub reorder_rate: Option<f64>,
    pub frame_ms: Option<i64>,
    pub ge_p_good_bad: Option<f64>,
    pub ge_p_bad_good: Option<f64>,
    pub burst_loss_rate: Option<f64>,
    pub burst_ms_mean: Option<i64>,
    pub handover_interval_ms_mean: Option<i64>,
}

/// `channel.snr_db` may be a single number or a list to sweep over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrList {
    Number(f64),
    List(Vec<f64>),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub snr_db: Option<NumberOrList>,
    pub fd_hz: Option<f64>,
    pub taps: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VocoderConfig {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub vad_dtx: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CryptoConfig {
    pub left_priv: Option<Value>,
    pub right_priv: Option<Value>,
}

/// A fully parsed and defaulted scenario, ready to drive an `Engine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResolved {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: i64,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: i64,
    #[serde(default = "default_bearer")]
    pub bearer: BearerConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub vocoder: VocoderConfig,
    #[serde(default)]
    pub cfo_hz: f64,
    #[serde(default)]
    pub ppm: f64,
    #[serde(skip_serializing, default)]
    pub crypto: CryptoConfig,
}

fn default_mode() -> String {
    "audio".to_string()
}
fn default_duration_ms() -> i64 {
    60_000
}
fn default_frame_ms() -> i64 {
    20
}
fn default_bearer() -> BearerConfig {
    BearerConfig {
        kind: Some("telco_volte_evs".to_string()),
        ..Default::default()
    }
}

impl ScenarioResolved {
    pub fn from_yaml(text: &str) -> Result<Self, ScenarioError> {
        let doc: BTreeMap<String, Value> =
            serde_yaml::from_str(text).map_err(|e| ScenarioError::MalformedDocument {
                reason: e.to_string(),
            })?;
        Self::from_yaml_dict(doc)
    }

    pub fn from_yaml_dict(doc: BTreeMap<String, Value>) -> Result<Self, ScenarioError> {
        let mode = match doc.get("mode") {
            Some(Value::String(s)) => s.clone(),
            None => default_mode(),
            Some(other) => {
                return Err(ScenarioError::InvalidMode {
                    value: format!("{other:?}"),
                })
            }
        };
        if mode != "audio" && mode != "byte" {
            return Err(ScenarioError::InvalidMode { value: mode });
        }

        let duration_ms = as_int(&doc, "duration_ms", default_duration_ms())?;
        let seed = as_int(&doc, "seed", 0)? as u64;
        let frame_ms = as_int(&doc, "frame_ms", default_frame_ms())?;

        let bearer: BearerConfig = match doc.get("bearer") {
            Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| {
                ScenarioError::MalformedDocument {
                    reason: format!("bearer: {e}"),
                }
            })?,
            None => default_bearer(),
        };
        if bearer.kind.is_none() {
            return Err(ScenarioError::MissingBearerType);
        }
        if let Some(mtu) = bearer.mtu_bytes {
            if mtu <= crate::sar::HEADER_LEN as i64 {
                return Err(ScenarioError::MtuTooSmall {
                    min: crate::sar::HEADER_LEN,
                    actual: mtu,
                });
            }
        }

        let channel: ChannelConfig = match doc.get("channel") {
            Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| {
                ScenarioError::MalformedDocument {
                    reason: format!("channel: {e}"),
                }
            })?,
            None => ChannelConfig::default(),
        };

        let vocoder: VocoderConfig = match doc.get("vocoder") {
            Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| {
                ScenarioError::MalformedDocument {
                    reason: format!("vocoder: {e}"),
                }
            })?,
            None => VocoderConfig::default(),
        };

        let crypto: CryptoConfig = match doc.get("crypto") {
            Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| {
                ScenarioError::MalformedDocument {
                    reason: format!("crypto: {e}"),
                }
            })?,
            None => CryptoConfig::default(),
        };

        let cfo_hz = doc
            .get("cfo_hz")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let ppm = doc.get("ppm").and_then(|v| v.as_f64()).unwrap_or(0.0);

        Ok(ScenarioResolved {
            mode,
            duration_ms,
            seed,
            frame_ms,
            bearer,
            channel,
            vocoder,
            cfo_hz,
            ppm,
            crypto,
        })
    }

    /// Expand a swept `channel.snr_db` list into independent scenario
    /// clones, each carrying a single SNR and a directory suffix. A
    /// non-swept scenario expands to one clone with an empty suffix.
    pub fn expand_sweep(&self) -> Vec<(String, ScenarioResolved)> {
        match &self.channel.snr_db {
            Some(NumberOrList::List(values)) if !values.is_empty() => values
                .iter()
                .map(|&v| {
                    let mut clone = self.clone();
                    clone.channel.snr_db = Some(NumberOrList::Number(v));
                    let suffix = if v.fract() == 0.0 {
                        format!("snr_{}", v as i64)
                    } else {
                        format!("snr_{v}")
                    };
                    (suffix, clone)
                })
                .collect(),
            _ => vec![(String::new(), self.clone())],
        }
    }

    /// Public view of the resolved scenario for the `scenario.resolved.yaml`
    /// artifact: omits `crypto` entirely so private key material is never
    /// written to disk.
    pub fn to_public_dict(&self) -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert("mode".to_string(), Value::String(self.mode.clone()));
        map.insert(
            "duration_ms".to_string(),
            Value::Number(self.duration_ms.into()),
        );
        map.insert("seed".to_string(), Value::Number(self.seed.into()));
        map.insert(
            "frame_ms".to_string(),
            Value::Number(self.frame_ms.into()),
        );
        map.insert(
            "bearer".to_string(),
            serde_yaml::to_value(&self.bearer).expect("BearerConfig serializes"),
        );
        map.insert(
            "channel".to_string(),
            serde_yaml::to_value(&self.channel).expect("ChannelConfig serializes"),
        );
        map.insert(
            "vocoder".to_string(),
            serde_yaml::to_value(&self.vocoder).expect("VocoderConfig serializes"),
        );
        map.insert("cfo_hz".to_string(), Value::from(self.cfo_hz));
        map.insert("ppm".to_string(), Value::from(self.ppm));
        map
    }

    pub fn write_resolved_yaml(&self) -> Result<String, ScenarioError> {
        serde_yaml::to_string(&self.to_public_dict()).map_err(|e| {
            ScenarioError::MalformedDocument {
                reason: e.to_string(),
            }
        })
    }
}

fn as_int(doc: &BTreeMap<String, Value>, field: &str, default: i64) -> Result<i64, ScenarioError> {
    match doc.get(field) {
        None => Ok(default),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else {
                Err(ScenarioError::MustBeInteger {
                    field: field.to_string(),
                    value: format!("{n:?}"),
                })
            }
        }
        Some(Value::Bool(b)) => Err(ScenarioError::MustBeInteger {
            field: field.to_string(),
            value: b.to_string(),
        }),
        Some(other) => Err(ScenarioError::MustBeInteger {
            field: field.to_string(),
            value: format!("{other:?}"),
        }),
    }
}
