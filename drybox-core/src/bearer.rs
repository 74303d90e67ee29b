//! Stochastic datagram bearer models: latency, jitter, loss, reorder.
//!
//! Every model shares one send/poll_deliver/stats algorithm (`Bearer`); the
//! model-specific drop predicate, extra delay, and reorder hook are captured
//! in the `BearerKind` enum per direction rather than duplicated per type.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp, Normal};

use crate::errors::BearerError;

/// A datagram in flight between send and delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub sent_ms: u64,
    pub deliver_ms: u64,
    pub seq: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BearerStatsSnapshot {
    pub loss_rate: f64,
    pub reorder_rate: f64,
    pub jitter_ms: f64,
}

/// Bearer-model-specific parameters and mutable state.
#[derive(Debug, Clone)]
pub enum BearerKind {
    VolteEvs {
        jitter_ms: i64,
        loss_rate: f64,
        reorder_rate: f64,
        frame_ms: i64,
        p_gb: f64,
        p_bg: f64,
        ge_bad: bool,
    },
    CsGsm {
        burst_loss_rate: f64,
        burst_ms_mean: i64,
        ho_interval_mean: i64,
        burst_until_ms: i64,
        next_ho_ms: i64,
    },
    PstnG711 {
        jitter_ms: i64,
    },
    OttUdp {
        jitter_ms: i64,
        loss_rate: f64,
        reorder_rate: f64,
        frame_ms: i64,
    },
}

/// Default parameters for each named bearer type, as used when a scenario
/// omits a field.
pub struct BearerParams {
    pub latency_ms: i64,
    pub mtu_bytes: usize,
    pub jitter_ms: i64,
    pub loss_rate: f64,
    pub reorder_rate: f64,
    pub frame_ms: i64,
    pub ge_p_good_bad: f64,
    pub ge_p_bad_good: f64,
    pub burst_loss_rate: f64,
    pub burst_ms_mean: i64,
    pub handover_interval_ms_mean: i64,
}

impl Default for BearerParams {
    fn default() -> Self {
        Self {
            latency_ms: 60,
            mtu_bytes: 1024,
            jitter_ms: 20,
            loss_rate: 0.0,
            reorder_rate: 0.0,
            frame_ms: 20,
            ge_p_good_bad: 0.001,
            ge_p_bad_good: 0.1,
            burst_loss_rate: 0.1,
            burst_ms_mean: 100,
            handover_interval_ms_mean: 8000,
        }
    }
}

impl BearerParams {
    fn defaults_for(kind: &str) -> Self {
        let base = Self::default();
        match kind {
            "telco_cs_gsm" | "cs_gsm" | "gsm" => Self {
                latency_ms: 120,
                mtu_bytes: 1024,
                ..base
            },
            "telco_pstn_g711" | "pstn_g711" | "pstn" => Self {
                latency_ms: 80,
                jitter_ms: 5,
                mtu_bytes: 1024,
                ..base
            },
            "ott_udp" | "udp" | "ip" => Self {
                latency_ms: 40,
                jitter_ms: 10,
                mtu_bytes: 1200,
                ..base
            },
            _ => base,
        }
    }
}

/// Common contract every bearer model satisfies.
pub struct Bearer {
    kind: BearerKind,
    rng: ChaCha8Rng,
    latency_ms: i64,
    queue: Vec<Datagram>,
    drops: u64,
    tx: u64,
    reorders: u64,
    last_delivered_seq: Option<u32>,
    seq_ctr: u32,
    last_transit: Option<i64>,
    jitter: f64,
}

impl Bearer {
    fn new(kind: BearerKind, latency_ms: i64, rng: ChaCha8Rng) -> Self {
        Self {
            kind,
            rng,
            latency_ms,
            queue: Vec::new(),
            drops: 0,
            tx: 0,
            reorders: 0,
            last_delivered_seq: None,
            seq_ctr: 0,
            last_transit: None,
            jitter: 0.0,
        }
    }

    /// Construct a bearer of the named model, applying scenario params over
    /// this model's own defaults where a field is omitted.
    pub fn make(kind: &str, params: &ScenarioBearerParams, rng: ChaCha8Rng) -> Result<Self, BearerError> {
        let defaults = BearerParams::defaults_for(kind);
        let latency_ms = params.latency_ms.unwrap_or(defaults.latency_ms);

        let model = match kind {
            "telco_volte_evs" | "volte_evs" | "volte" => BearerKind::VolteEvs {
                jitter_ms: params.jitter_ms.unwrap_or(defaults.jitter_ms),
                loss_rate: params.loss_rate.unwrap_or(defaults.loss_rate),
                reorder_rate: params.reorder_rate.unwrap_or(defaults.reorder_rate),
                frame_ms: params.frame_ms.unwrap_or(defaults.frame_ms),
                p_gb: params.ge_p_good_bad.unwrap_or(defaults.ge_p_good_bad),
                p_bg: params.ge_p_bad_good.unwrap_or(defaults.ge_p_bad_good),
                ge_bad: false,
            },
            "telco_cs_gsm" | "cs_gsm" | "gsm" => BearerKind::CsGsm {
                burst_loss_rate: params.burst_loss_rate.unwrap_or(defaults.burst_loss_rate),
                burst_ms_mean: params.burst_ms_mean.unwrap_or(defaults.burst_ms_mean),
                ho_interval_mean: params
                    .handover_interval_ms_mean
                    .unwrap_or(defaults.handover_interval_ms_mean),
                burst_until_ms: -1,
                next_ho_ms: params
                    .handover_interval_ms_mean
                    .unwrap_or(defaults.handover_interval_ms_mean),
            },
            "telco_pstn_g711" | "pstn_g711" | "pstn" => BearerKind::PstnG711 {
                jitter_ms: params.jitter_ms.unwrap_or(defaults.jitter_ms),
            },
            "ott_udp" | "udp" | "ip" => BearerKind::OttUdp {
                jitter_ms: params.jitter_ms.unwrap_or(defaults.jitter_ms),
                loss_rate: params.loss_rate.unwrap_or(defaults.loss_rate),
                reorder_rate: params.reorder_rate.unwrap_or(defaults.reorder_rate),
                frame_ms: params.frame_ms.unwrap_or(defaults.frame_ms),
            },
            other => {
                return Err(BearerError::UnknownKind {
                    kind: other.to_string(),
                })
            }
        };

        Ok(Self::new(model, latency_ms, rng))
    }

    /// Queue a copy of `payload`, applying the model's drop/delay/reorder
    /// behavior. A dropped send only increments the drop counter.
    pub fn send(&mut self, payload: &[u8], now_ms: u64) {
        self.tx += 1;

        // CS-GSM tracks wall time and mutates its own latency on handover
        // before the generic drop check runs.
        if let BearerKind::CsGsm {
            burst_loss_rate: _,
            burst_ms_mean,
            ho_interval_mean,
            burst_until_ms,
            next_ho_ms,
        } = &mut self.kind
        {
            let now = now_ms as i64;
            if now > *burst_until_ms && self.rng.gen::<f64>() < 0.02 {
                let mean = (*burst_ms_mean).max(1) as f64;
                let draw = Exp::new(1.0 / mean).unwrap().sample(&mut self.rng);
                *burst_until_ms = now + (draw as i64).max(20);
            }
            if now >= *next_ho_ms {
                self.latency_ms += 20;
                let mean = (*ho_interval_mean).max(1) as f64;
                let draw = Exp::new(1.0 / mean).unwrap().sample(&mut self.rng);
                *next_ho_ms = now + (draw as i64).max(1000);
            }
        }

        if self.should_drop(now_ms) {
            self.drops += 1;
            return;
        }

        let extra = self.extra_delay_ms();
        let deliver_ms = (now_ms as i64 + self.latency_ms + extra).max(now_ms as i64) as u64;
        let seq = self.seq_ctr;
        self.seq_ctr = (self.seq_ctr + 1) & 0x7FFF_FFFF;

        let mut item = Datagram {
            payload: payload.to_vec(),
            sent_ms: now_ms,
            deliver_ms,
            seq,
        };
        self.maybe_reorder(&mut item);
        self.queue.push(item);
    }

    fn should_drop(&mut self, now_ms: u64) -> bool {
        match &mut self.kind {
            BearerKind::VolteEvs {
                loss_rate,
                p_gb,
                p_bg,
                ge_bad,
                ..
            } => {
                if *ge_bad {
                    if self.rng.gen::<f64>() < *p_bg {
                        *ge_bad = false;
                    }
                } else if self.rng.gen::<f64>() < *p_gb {
                    *ge_bad = true;
                }
                let p = loss_rate.to_owned() + if *ge_bad { 0.30 } else { 0.0 };
                self.rng.gen::<f64>() < p.clamp(0.0, 1.0)
            }
            BearerKind::CsGsm {
                burst_loss_rate,
                burst_until_ms,
                ..
            } => {
                let p = if (now_ms as i64) <= *burst_until_ms {
                    *burst_loss_rate
                } else {
                    0.01
                };
                self.rng.gen::<f64>() < p.clamp(0.0, 1.0)
            }
            BearerKind::PstnG711 { .. } => false,
            BearerKind::OttUdp { loss_rate, .. } => self.rng.gen::<f64>() < *loss_rate,
        }
    }

    fn extra_delay_ms(&mut self) -> i64 {
        match &self.kind {
            BearerKind::VolteEvs { jitter_ms, .. } => {
                if *jitter_ms <= 0 {
                    return 0;
                }
                let sigma = (*jitter_ms as f64 / 2.0).max(1.0);
                let val = Normal::new(0.0, sigma).unwrap().sample(&mut self.rng);
                val.clamp(-3.0 * sigma, 3.0 * sigma).round() as i64
            }
            BearerKind::CsGsm { .. } => self.rng.gen_range(-5.0..5.0) as i64,
            BearerKind::PstnG711 { jitter_ms } => {
                if *jitter_ms == 0 {
                    0
                } else {
                    let bound = *jitter_ms as f64;
                    self.rng.gen_range(-bound..bound) as i64
                }
            }
            BearerKind::OttUdp { jitter_ms, .. } => {
                let sigma = (*jitter_ms as f64 / 2.0).max(1.0);
                Normal::new(0.0, sigma).unwrap().sample(&mut self.rng) as i64
            }
        }
    }

    fn maybe_reorder(&mut self, item: &mut Datagram) {
        match &self.kind {
            BearerKind::VolteEvs {
                reorder_rate,
                frame_ms,
                ..
            } => {
                if *reorder_rate > 0.0 && self.rng.gen::<f64>() < *reorder_rate {
                    item.deliver_ms += *frame_ms as u64;
                }
            }
            BearerKind::OttUdp {
                reorder_rate,
                frame_ms,
                ..
            } => {
                if self.rng.gen::<f64>() < *reorder_rate {
                    item.deliver_ms += *frame_ms as u64;
                }
            }
            BearerKind::CsGsm { .. } | BearerKind::PstnG711 { .. } => {}
        }
    }

    /// Return datagrams whose `deliver_ms` has arrived, in ascending
    /// `deliver_ms` order, updating reorder/jitter statistics as a side
    /// effect.
    pub fn poll_deliver(&mut self, now_ms: u64) -> Vec<Datagram> {
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for item in self.queue.drain(..) {
            if item.deliver_ms <= now_ms {
                due.push(item);
            } else {
                keep.push(item);
            }
        }
        self.queue = keep;
        due.sort_by_key(|d| d.deliver_ms);

        for item in &due {
            if let Some(last) = self.last_delivered_seq {
                if item.seq < last {
                    self.reorders += 1;
                }
            }
            self.last_delivered_seq = Some(item.seq);

            let transit = item.deliver_ms as i64 - item.sent_ms as i64;
            if let Some(last_transit) = self.last_transit {
                let d = (transit - last_transit).unsigned_abs() as f64;
                self.jitter += (d - self.jitter) / 16.0;
            }
            self.last_transit = Some(transit);
        }

        due
    }

    pub fn stats(&self) -> BearerStatsSnapshot {
        let loss_rate = if self.tx == 0 {
            0.0
        } else {
            self.drops as f64 / self.tx as f64
        };
        let reorder_rate = if self.tx == 0 {
            0.0
        } else {
            self.reorders as f64 / (self.tx - self.drops).max(1) as f64
        };
        BearerStatsSnapshot {
            loss_rate,
            reorder_rate,
            jitter_ms: self.jitter,
        }
    }
}

/// The subset of a scenario bearer spec relevant to constructing a `Bearer`.
#[derive(Debug, Clone, Default)]
pub struct ScenarioBearerParams {
    pub latency_ms: Option<i64>,
    pub mtu_bytes: Option<usize>,
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
