//! The tick-driven simulation engine: wires scenario, bearer, SAR, channel,
//! vocoder, crypto, adapters, capture, and metrics into one deterministic
//! run.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::adapter::{
    AdapterCapabilities, AdapterContext, AdapterCrypto, AdapterInstance, AdapterRegistry,
    AudioBlock, ByteLink, EmittedEvents, Side,
};
use crate::bearer::{Bearer, ScenarioBearerParams};
use crate::capture::{CaptureEvent, CaptureWriter, Layer, Side as CapSide};
use crate::channel::SampleChannel;
use crate::crypto::{self, SuppliedKey};
use crate::errors::{DryBoxError, EngineError};
use crate::logging::{LogConfig, SignalLogger};
use crate::metrics::{crypto_event_payload, MetricRow, MetricsWriter};
use crate::sar::{SarFragmenter, SarReassembler};
use crate::scenario::{NumberOrList, ScenarioResolved};
use crate::vocoder::{Vocoder, VocoderKind};

const DEFAULT_SDU_MAX: usize = 1024;
const BUDGET_PER_TICK: usize = 64;

pub struct EngineConfig {
    pub tick_ms: u64,
    pub out_dir: std::path::PathBuf,
}

/// Runs one scenario to completion against a pair of already-resolved
/// adapter instances.
pub struct Engine {
    scenario: ScenarioResolved,
    tick_ms: u64,
    t_ms: u64,
    left: AdapterInstance,
    right: AdapterInstance,
    bearer_l2r: Bearer,
    bearer_r2l: Bearer,
    sar_active: bool,
    frag_l2r: Option<SarFragmenter>,
    frag_r2l: Option<SarFragmenter>,
    reas_l: SarReassembler,
    reas_r: SarReassembler,
    rtt_est: u64,
    channel_l2r: Option<SampleChannel>,
    channel_r2l: Option<SampleChannel>,
    vocoder_l: Option<Vocoder>,
    vocoder_r: Option<Vocoder>,
    frame_loss_rng: ChaCha8Rng,
    metrics: MetricsWriter,
    capture: CaptureWriter,
    logger: SignalLogger,
    clock: Rc<Cell<u64>>,
    events_l: EmittedEvents,
    events_r: EmittedEvents,
    left_crypto: AdapterCrypto,
    right_crypto: AdapterCrypto,
}

impl Engine {
    pub fn new(
        scenario: ScenarioResolved,
        config: EngineConfig,
        registry: &AdapterRegistry,
        left_spec: &str,
        right_spec: &str,
    ) -> Result<Self, DryBoxError> {
        let left = registry
            .resolve(left_spec)
            .map_err(DryBoxError::Adapter)?;
        let right = registry
            .resolve(right_spec)
            .map_err(DryBoxError::Adapter)?;

        require_mode_supported(&scenario.mode, left.capabilities(), right.capabilities())?;

        let left_supplied: Option<SuppliedKey> = scenario
            .crypto
            .left_priv
            .as_ref()
            .and_then(crypto::supplied_key_from_yaml);
        let right_supplied: Option<SuppliedKey> = scenario
            .crypto
            .right_priv
            .as_ref()
            .and_then(crypto::supplied_key_from_yaml);

        let (left_pub, right_pub) = {
            let (lk, rk) = crypto::resolve_keypairs(
                scenario.seed,
                left_spec,
                right_spec,
                left_supplied.as_ref(),
                right_supplied.as_ref(),
                |p| std::fs::read_to_string(p),
            )
            .map_err(DryBoxError::Crypto)?;
            (lk, rk)
        };

        std::fs::create_dir_all(&config.out_dir).map_err(crate::errors::CaptureError::Io)?;
        write_pubkeys_artifact(
            &config.out_dir,
            left_spec,
            right_spec,
            &left_pub,
            &right_pub,
        )
        .map_err(crate::errors::CaptureError::Io)
        .map_err(DryBoxError::Capture)?;
        let mut metrics = MetricsWriter::create(
            config.out_dir.join("metrics.csv"),
            config.out_dir.join("events.jsonl"),
        )
        .map_err(DryBoxError::Metrics)?;
        let capture = CaptureWriter::create(config.out_dir.join("capture.dbxcap"))
            .map_err(DryBoxError::Capture)?;

        metrics
            .write_event(
                0,
                "L",
                "handshake",
                crypto_event_payload(&crypto::key_id(&left_pub.public), provenance_str(left_pub.provenance)),
            )
            .map_err(DryBoxError::Metrics)?;
        metrics
            .write_event(
                0,
                "R",
                "handshake",
                crypto_event_payload(&crypto::key_id(&right_pub.public), provenance_str(right_pub.provenance)),
            )
            .map_err(DryBoxError::Metrics)?;

        let bearer_kind = scenario
            .bearer
            .kind
            .clone()
            .ok_or(crate::errors::ScenarioError::MissingBearerType)
            .map_err(DryBoxError::Scenario)?;
        let bearer_params = ScenarioBearerParams {
            latency_ms: scenario.bearer.latency_ms,
            mtu_bytes: scenario.bearer.mtu_bytes.map(|v| v as usize),
            jitter_ms: scenario.bearer.jitter_ms,
            loss_rate: scenario.bearer.loss_rate,
            reorder_rate: scenario.bearer.reorder_rate,
            frame_ms: scenario.bearer.frame_ms,
            ge_p_good_bad: scenario.bearer.ge_p_good_bad,
            ge_p_bad_good: scenario.bearer.ge_p_bad_good,
            burst_loss_rate: scenario.bearer.burst_loss_rate,
            burst_ms_mean: scenario.bearer.burst_ms_mean,
            handover_interval_ms_mean: scenario.bearer.handover_interval_ms_mean,
        };

        let bearer_l2r = Bearer::make(
            &bearer_kind,
            &bearer_params,
            ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xB0A1),
        )
        .map_err(DryBoxError::Bearer)?;
        let bearer_r2l = Bearer::make(
            &bearer_kind,
            &bearer_params,
            ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xB0A2),
        )
        .map_err(DryBoxError::Bearer)?;

        let sdu_max_bytes = left
            .capabilities()
            .sdu_max_bytes
            .max(right.capabilities().sdu_max_bytes) as usize;
        let mtu = scenario.bearer.mtu_bytes.unwrap_or(DEFAULT_SDU_MAX as i64) as usize;
        let sar_active = mtu < sdu_max_bytes;
        let frag_l2r = sar_active.then(|| SarFragmenter::new(mtu)).transpose().map_err(DryBoxError::Sar)?;
        let frag_r2l = sar_active.then(|| SarFragmenter::new(mtu)).transpose().map_err(DryBoxError::Sar)?;

        let lat_ms = scenario.bearer.latency_ms.unwrap_or(60).max(0) as u64;
        let rtt_est = (2 * lat_ms).max(1);
        let reas_l = SarReassembler::new(2 * rtt_est, sar_active);
        let reas_r = SarReassembler::new(2 * rtt_est, sar_active);

        let (channel_l2r, channel_r2l, vocoder_l, vocoder_r) = if scenario.mode == "audio" {
            let snr_db = match &scenario.channel.snr_db {
                Some(NumberOrList::Number(v)) => *v,
                Some(NumberOrList::List(values)) => values.first().copied().unwrap_or(20.0),
                None => 20.0,
            };
            let vad_dtx = scenario.vocoder.vad_dtx.unwrap_or(false);
            let kind = VocoderKind::from_str(
                scenario
                    .vocoder
                    .kind
                    .as_deref()
                    .unwrap_or("amr12k2_mock"),
            )
            .map_err(DryBoxError::Vocoder)?;
            let channel_kind = scenario.channel.kind.as_deref().unwrap_or("awgn");
            let fd_hz = scenario.channel.fd_hz.unwrap_or(1.0);
            let taps = scenario.channel.taps.unwrap_or(8).max(1) as usize;
            let mut chan_rng_l2r = ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xCA0E1);
            let mut chan_rng_r2l = ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xCA0E2);
            (
                Some(
                    SampleChannel::new(channel_kind, snr_db, fd_hz, taps, 8000, &mut chan_rng_l2r)
                        .map_err(DryBoxError::Channel)?,
                ),
                Some(
                    SampleChannel::new(channel_kind, snr_db, fd_hz, taps, 8000, &mut chan_rng_r2l)
                        .map_err(DryBoxError::Channel)?,
                ),
                Some(Vocoder::new(kind, vad_dtx, ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xC0DE1))),
                Some(Vocoder::new(kind, vad_dtx, ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xC0DE2))),
            )
        } else {
            (None, None, None, None)
        };

        let frame_loss_rng = ChaCha8Rng::seed_from_u64(scenario.seed ^ 0xF0A5E);

        let left_crypto = AdapterCrypto {
            priv_key: left_pub.private,
            public: left_pub.public,
            peer_pub: right_pub.public,
            key_id: crypto::key_id(&left_pub.public),
            peer_key_id: crypto::key_id(&right_pub.public),
            provenance: left_pub.provenance,
        };
        let right_crypto = AdapterCrypto {
            priv_key: right_pub.private,
            public: right_pub.public,
            peer_pub: left_pub.public,
            key_id: crypto::key_id(&right_pub.public),
            peer_key_id: crypto::key_id(&left_pub.public),
            provenance: right_pub.provenance,
        };

        Ok(Self {
            scenario,
            tick_ms: config.tick_ms,
            t_ms: 0,
            left,
            right,
            bearer_l2r,
            bearer_r2l,
            sar_active,
            frag_l2r,
            frag_r2l,
            reas_l,
            reas_r,
            rtt_est,
            channel_l2r,
            channel_r2l,
            vocoder_l,
            vocoder_r,
            frame_loss_rng,
            metrics,
            capture,
            logger: SignalLogger::new(LogConfig::default()),
            clock: Rc::new(Cell::new(0)),
            events_l: Rc::new(RefCell::new(VecDeque::new())),
            events_r: Rc::new(RefCell::new(VecDeque::new())),
            left_crypto,
            right_crypto,
        })
    }

    /// Run the whole scenario to completion. Returns the process exit code
    /// on success (always 0 for a run that completes its duration).
    pub fn run(mut self) -> Result<i32, DryBoxError> {
        let ctx_l = AdapterContext::new(
            self.clock.clone(),
            self.events_l.clone(),
            Side::L,
            ChaCha8Rng::seed_from_u64(self.scenario.seed ^ 0xADA9E1),
            self.left_crypto.clone(),
        );
        let ctx_r = AdapterContext::new(
            self.clock.clone(),
            self.events_r.clone(),
            Side::R,
            ChaCha8Rng::seed_from_u64(self.scenario.seed ^ 0xADA9E2),
            self.right_crypto.clone(),
        );
        self.left.start(ctx_l);
        self.right.start(ctx_r);

        let duration = self.scenario.duration_ms.max(0) as u64;
        let mut bytes_rx_l: u64 = 0;
        let mut bytes_rx_r: u64 = 0;
        let mut window_start_ms: u64 = 0;

        let result = (|| -> Result<(), DryBoxError> {
            while self.t_ms <= duration {
                self.clock.set(self.t_ms);
                self.tick_adapters()?;

                match self.scenario.mode.as_str() {
                    "audio" => self.tick_audio()?,
                    _ => self.tick_byte(&mut bytes_rx_l, &mut bytes_rx_r)?,
                }

                self.drain_adapter_events()?;

                if self.t_ms.saturating_sub(window_start_ms) >= 1000 {
                    self.write_goodput(bytes_rx_l, bytes_rx_r, window_start_ms)?;
                    bytes_rx_l = 0;
                    bytes_rx_r = 0;
                    window_start_ms = self.t_ms;
                }

                self.t_ms += self.tick_ms;
            }
            Ok(())
        })();

        // Adapter stop() errors are swallowed per the engine's teardown contract.
        let _ = catch_adapter_call(|| self.left.stop());
        let _ = catch_adapter_call(|| self.right.stop());
        self.metrics.close().map_err(DryBoxError::Metrics)?;
        self.capture.close().map_err(DryBoxError::Capture)?;

        result?;
        Ok(0)
    }

    /// Call `on_timer` on both adapters. A panicking adapter is contained:
    /// the error is logged and the tick continues rather than aborting the
    /// run, per the engine's best-effort adapter-runtime-error policy.
    fn tick_adapters(&mut self) -> Result<(), DryBoxError> {
        let t_ms = self.t_ms;
        let left_result = match &mut self.left {
            AdapterInstance::Byte(a) => catch_adapter_call(|| a.on_timer(t_ms)),
            AdapterInstance::Audio(a) => catch_adapter_call(|| a.on_timer(t_ms)),
        };
        if let Err(reason) = left_result {
            report_adapter_runtime_error(
                &mut self.logger,
                &mut self.metrics,
                t_ms,
                "L",
                "on_timer",
                &reason,
            )?;
        }

        let right_result = match &mut self.right {
            AdapterInstance::Byte(a) => catch_adapter_call(|| a.on_timer(t_ms)),
            AdapterInstance::Audio(a) => catch_adapter_call(|| a.on_timer(t_ms)),
        };
        if let Err(reason) = right_result {
            report_adapter_runtime_error(
                &mut self.logger,
                &mut self.metrics,
                t_ms,
                "R",
                "on_timer",
                &reason,
            )?;
        }
        Ok(())
    }

    /// Flush events queued via `AdapterContext::emit_event` this tick into
    /// `events.jsonl`, tagged with the side that emitted them.
    fn drain_adapter_events(&mut self) -> Result<(), DryBoxError> {
        while let Some((t_ms, kind, payload)) = self.events_l.borrow_mut().pop_front() {
            self.metrics
                .write_event(t_ms, "L", &kind, payload)
                .map_err(DryBoxError::Metrics)?;
        }
        while let Some((t_ms, kind, payload)) = self.events_r.borrow_mut().pop_front() {
            self.metrics
                .write_event(t_ms, "R", &kind, payload)
                .map_err(DryBoxError::Metrics)?;
        }
        Ok(())
    }

    fn tick_byte(
        &mut self,
        bytes_rx_l: &mut u64,
        bytes_rx_r: &mut u64,
    ) -> Result<(), DryBoxError> {
        let t_ms = self.t_ms;
        let rtt_est = self.rtt_est;

        if let AdapterInstance::Byte(left) = &mut self.left {
            for _ in 0..BUDGET_PER_TICK {
                let sdu = match catch_adapter_call(|| left.on_link_tx(t_ms)) {
                    Ok(sdu) => sdu,
                    Err(reason) => {
                        report_adapter_runtime_error(
                            &mut self.logger,
                            &mut self.metrics,
                            t_ms,
                            "L",
                            "on_link_tx",
                            &reason,
                        )?;
                        break;
                    }
                };
                let Some(sdu) = sdu else {
                    break;
                };
                let payloads = match &mut self.frag_l2r {
                    Some(frag) if self.sar_active => frag.fragment(&sdu),
                    _ => vec![sdu],
                };
                for p in payloads {
                    self.bearer_l2r.send(&p, t_ms);
                    self.capture
                        .write_record(t_ms, CapSide::LeftToRight, Layer::Bearer, CaptureEvent::Tx, &p)
                        .map_err(DryBoxError::Capture)?;
                    self.metrics
                        .write_metric(&MetricRow {
                            t_ms,
                            side: "L".to_string(),
                            layer: "bearer".to_string(),
                            event: "tx".to_string(),
                            rtt_ms_est: Some(rtt_est as f64),
                            ..Default::default()
                        })
                        .map_err(DryBoxError::Metrics)?;
                }
            }
        }

        if let AdapterInstance::Byte(right) = &mut self.right {
            for _ in 0..BUDGET_PER_TICK {
                let sdu = match catch_adapter_call(|| right.on_link_tx(t_ms)) {
                    Ok(sdu) => sdu,
                    Err(reason) => {
                        report_adapter_runtime_error(
                            &mut self.logger,
                            &mut self.metrics,
                            t_ms,
                            "R",
                            "on_link_tx",
                            &reason,
                        )?;
                        break;
                    }
                };
                let Some(sdu) = sdu else {
                    break;
                };
                let payloads = match &mut self.frag_r2l {
                    Some(frag) if self.sar_active => frag.fragment(&sdu),
                    _ => vec![sdu],
                };
                for p in payloads {
                    self.bearer_r2l.send(&p, t_ms);
                    self.capture
                        .write_record(t_ms, CapSide::RightToLeft, Layer::Bearer, CaptureEvent::Tx, &p)
                        .map_err(DryBoxError::Capture)?;
                    self.metrics
                        .write_metric(&MetricRow {
                            t_ms,
                            side: "R".to_string(),
                            layer: "bearer".to_string(),
                            event: "tx".to_string(),
                            rtt_ms_est: Some(rtt_est as f64),
                            ..Default::default()
                        })
                        .map_err(DryBoxError::Metrics)?;
                }
            }
        }

        for dat in self.bearer_l2r.poll_deliver(t_ms) {
            self.capture
                .write_record(t_ms, CapSide::LeftToRight, Layer::Bearer, CaptureEvent::Rx, &dat.payload)
                .map_err(DryBoxError::Capture)?;
            let lat = t_ms.saturating_sub(dat.sent_ms);
            let sdu = if self.sar_active {
                self.reas_r.push_fragment(&dat.payload, t_ms)
            } else {
                Some(dat.payload)
            };
            if let Some(sdu) = sdu {
                let stats = self.bearer_l2r.stats();
                if let AdapterInstance::Byte(right) = &mut self.right {
                    if let Err(reason) = catch_adapter_call(|| right.on_link_rx(t_ms, &sdu)) {
                        report_adapter_runtime_error(
                            &mut self.logger,
                            &mut self.metrics,
                            t_ms,
                            "R",
                            "on_link_rx",
                            &reason,
                        )?;
                    }
                }
                *bytes_rx_r += sdu.len() as u64;
                self.metrics
                    .write_metric(&MetricRow {
                        t_ms,
                        side: "R".to_string(),
                        layer: "bytelink".to_string(),
                        event: "rx".to_string(),
                        latency_ms: Some(lat as f64),
                        jitter_ms: Some(stats.jitter_ms),
                        loss_rate: Some(stats.loss_rate),
                        reorder_rate: Some(stats.reorder_rate),
                        ..Default::default()
                    })
                    .map_err(DryBoxError::Metrics)?;
            }
        }

        for dat in self.bearer_r2l.poll_deliver(t_ms) {
            self.capture
                .write_record(t_ms, CapSide::RightToLeft, Layer::Bearer, CaptureEvent::Rx, &dat.payload)
                .map_err(DryBoxError::Capture)?;
            let lat = t_ms.saturating_sub(dat.sent_ms);
            let sdu = if self.sar_active {
                self.reas_l.push_fragment(&dat.payload, t_ms)
            } else {
                Some(dat.payload)
            };
            if let Some(sdu) = sdu {
                let stats = self.bearer_r2l.stats();
                if let AdapterInstance::Byte(left) = &mut self.left {
                    if let Err(reason) = catch_adapter_call(|| left.on_link_rx(t_ms, &sdu)) {
                        report_adapter_runtime_error(
                            &mut self.logger,
                            &mut self.metrics,
                            t_ms,
                            "L",
                            "on_link_rx",
                            &reason,
                        )?;
                    }
                }
                *bytes_rx_l += sdu.len() as u64;
                self.metrics
                    .write_metric(&MetricRow {
                        t_ms,
                        side: "L".to_string(),
                        layer: "bytelink".to_string(),
                        event: "rx".to_string(),
                        latency_ms: Some(lat as f64),
                        jitter_ms: Some(stats.jitter_ms),
                        loss_rate: Some(stats.loss_rate),
                        reorder_rate: Some(stats.reorder_rate),
                        ..Default::default()
                    })
                    .map_err(DryBoxError::Metrics)?;
            }
        }

        Ok(())
    }

    fn tick_audio(&mut self) -> Result<(), DryBoxError> {
        let t_ms = self.t_ms;
        let frame_loss_rate = self.scenario.bearer.loss_rate.unwrap_or(0.0);

        if let AdapterInstance::Audio(left) = &mut self.left {
            let frame = match catch_adapter_call(|| left.on_tx_frame(t_ms)) {
                Ok(frame) => frame,
                Err(reason) => {
                    report_adapter_runtime_error(
                        &mut self.logger,
                        &mut self.metrics,
                        t_ms,
                        "L",
                        "on_tx_frame",
                        &reason,
                    )?;
                    None
                }
            };
            if let Some(pcm) = frame {
                self.capture
                    .write_record(t_ms, CapSide::LeftToRight, Layer::Bearer, CaptureEvent::Tx, &pcm_bytes(&pcm))
                    .map_err(DryBoxError::Capture)?;

                let impaired = self
                    .channel_l2r
                    .as_mut()
                    .map(|c| c.apply(&pcm, &mut self.frame_loss_rng))
                    .unwrap_or_else(|| pcm.clone());
                let snr_db_est = self
                    .channel_l2r
                    .is_some()
                    .then(|| crate::channel::AwgnChannel::estimated_snr(&pcm, &impaired));

                let lost = crate::vocoder::draw_frame_loss(&mut self.frame_loss_rng, frame_loss_rate);
                if lost {
                    self.logger.debug("BEARER", "audio frame dropped L->R");
                    self.capture
                        .write_record(t_ms, CapSide::LeftToRight, Layer::Bearer, CaptureEvent::Drop, &[])
                        .map_err(DryBoxError::Capture)?;
                    self.metrics
                        .write_metric(&MetricRow {
                            t_ms,
                            side: "R".to_string(),
                            layer: "bearer".to_string(),
                            event: "drop".to_string(),
                            per: Some(1.0),
                            ..Default::default()
                        })
                        .map_err(DryBoxError::Metrics)?;
                    if let Some(v) = self.vocoder_r.as_mut() {
                        v.process_frame(None);
                    }
                } else {
                    let decoded = self
                        .vocoder_r
                        .as_mut()
                        .map(|v| {
                            let bits = v.encode(&impaired);
                            let pcm_out = v.decode(&bits);
                            v.process_frame(Some(&pcm_out))
                        })
                        .unwrap_or(impaired);
                    self.capture
                        .write_record(t_ms, CapSide::LeftToRight, Layer::Bearer, CaptureEvent::Rx, &pcm_bytes(&decoded))
                        .map_err(DryBoxError::Capture)?;
                    self.metrics
                        .write_metric(&MetricRow {
                            t_ms,
                            side: "R".to_string(),
                            layer: "bearer".to_string(),
                            event: "rx".to_string(),
                            latency_ms: Some(self.scenario.bearer.latency_ms.unwrap_or(0) as f64),
                            snr_db_est,
                            per: Some(0.0),
                            ..Default::default()
                        })
                        .map_err(DryBoxError::Metrics)?;
                    if let AdapterInstance::Audio(right) = &mut self.right {
                        if let Err(reason) = catch_adapter_call(|| right.on_rx_frame(t_ms, &decoded)) {
                            report_adapter_runtime_error(
                                &mut self.logger,
                                &mut self.metrics,
                                t_ms,
                                "R",
                                "on_rx_frame",
                                &reason,
                            )?;
                        }
                    }
                }
            }
        }

        if let AdapterInstance::Audio(right) = &mut self.right {
            let frame = match catch_adapter_call(|| right.on_tx_frame(t_ms)) {
                Ok(frame) => frame,
                Err(reason) => {
                    report_adapter_runtime_error(
                        &mut self.logger,
                        &mut self.metrics,
                        t_ms,
                        "R",
                        "on_tx_frame",
                        &reason,
                    )?;
                    None
                }
            };
            if let Some(pcm) = frame {
                self.capture
                    .write_record(t_ms, CapSide::RightToLeft, Layer::Bearer, CaptureEvent::Tx, &pcm_bytes(&pcm))
                    .map_err(DryBoxError::Capture)?;

                let impaired = self
                    .channel_r2l
                    .as_mut()
                    .map(|c| c.apply(&pcm, &mut self.frame_loss_rng))
                    .unwrap_or_else(|| pcm.clone());
                let snr_db_est = self
                    .channel_r2l
                    .is_some()
                    .then(|| crate::channel::AwgnChannel::estimated_snr(&pcm, &impaired));

                let lost = crate::vocoder::draw_frame_loss(&mut self.frame_loss_rng, frame_loss_rate);
                if lost {
                    self.logger.debug("BEARER", "audio frame dropped R->L");
                    self.capture
                        .write_record(t_ms, CapSide::RightToLeft, Layer::Bearer, CaptureEvent::Drop, &[])
                        .map_err(DryBoxError::Capture)?;
                    self.metrics
                        .write_metric(&MetricRow {
                            t_ms,
                            side: "L".to_string(),
                            layer: "bearer".to_string(),
                            event: "drop".to_string(),
                            per: Some(1.0),
                            ..Default::default()
                        })
                        .map_err(DryBoxError::Metrics)?;
                    if let Some(v) = self.vocoder_l.as_mut() {
                        v.process_frame(None);
                    }
                } else {
                    let decoded = self
                        .vocoder_l
                        .as_mut()
                        .map(|v| {
                            let bits = v.encode(&impaired);
                            let pcm_out = v.decode(&bits);
                            v.process_frame(Some(&pcm_out))
                        })
                        .unwrap_or(impaired);
                    self.capture
                        .write_record(t_ms, CapSide::RightToLeft, Layer::Bearer, CaptureEvent::Rx, &pcm_bytes(&decoded))
                        .map_err(DryBoxError::Capture)?;
                    self.metrics
                        .write_metric(&MetricRow {
                            t_ms,
                            side: "L".to_string(),
                            layer: "bearer".to_string(),
                            event: "rx".to_string(),
                            latency_ms: Some(self.scenario.bearer.latency_ms.unwrap_or(0) as f64),
                            snr_db_est,
                            per: Some(0.0),
                            ..Default::default()
                        })
                        .map_err(DryBoxError::Metrics)?;
                    if let AdapterInstance::Audio(left) = &mut self.left {
                        if let Err(reason) = catch_adapter_call(|| left.on_rx_frame(t_ms, &decoded)) {
                            report_adapter_runtime_error(
                                &mut self.logger,
                                &mut self.metrics,
                                t_ms,
                                "L",
                                "on_rx_frame",
                                &reason,
                            )?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn write_goodput(
        &mut self,
        bytes_rx_l: u64,
        bytes_rx_r: u64,
        window_start_ms: u64,
    ) -> Result<(), DryBoxError> {
        let window = self.t_ms.saturating_sub(window_start_ms).max(1) as f64;
        let g_l = (bytes_rx_l * 8) as f64 / window * 1000.0;
        let g_r = (bytes_rx_r * 8) as f64 / window * 1000.0;
        self.metrics
            .write_metric(&MetricRow {
                t_ms: self.t_ms,
                side: "L".to_string(),
                layer: "bytelink".to_string(),
                event: "tick".to_string(),
                goodput_bps: Some(g_l),
                ..Default::default()
            })
            .map_err(DryBoxError::Metrics)?;
        self.metrics
            .write_metric(&MetricRow {
                t_ms: self.t_ms,
                side: "R".to_string(),
                layer: "bytelink".to_string(),
                event: "tick".to_string(),
                goodput_bps: Some(g_r),
                ..Default::default()
            })
            .map_err(DryBoxError::Metrics)?;
        Ok(())
    }
}

/// Run an adapter callback with unwinding containment. Adapters are
/// arbitrary user code; a panic inside one must not take the whole run
/// down with it. `AssertUnwindSafe` is sound here because a poisoned
/// adapter is simply discarded from further use of the value it touched
/// within this call (we never observe partial mutation across the
/// unwind boundary other than through the adapter's own subsequent calls,
/// which the scenario accepts as best-effort once an adapter has faulted).
fn catch_adapter_call<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(describe_panic)
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "adapter panicked with a non-string payload".to_string()
    }
}

/// Log and record a contained adapter-runtime fault without aborting the
/// tick. Takes the writer fields directly (rather than `&mut self`) so it
/// can be called while a disjoint field of `Engine` (the faulting
/// adapter) is still mutably borrowed.
fn report_adapter_runtime_error(
    logger: &mut SignalLogger,
    metrics: &mut MetricsWriter,
    t_ms: u64,
    side: &str,
    callback: &str,
    reason: &str,
) -> Result<(), DryBoxError> {
    let err = EngineError::AdapterRuntime {
        side: side.to_string(),
        callback: callback.to_string(),
        reason: reason.to_string(),
    };
    logger.error("ENGINE", err.to_string());
    metrics
        .write_event(
            t_ms,
            side,
            "error",
            serde_json::json!({"callback": callback, "reason": reason}),
        )
        .map_err(DryBoxError::Metrics)
}

fn provenance_str(p: crypto::Provenance) -> &'static str {
    match p {
        crypto::Provenance::Scenario => "scenario",
        crypto::Provenance::Derived => "derived",
    }
}

fn pcm_bytes(pcm: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Write the `pubkeys.txt` run artifact: public keys, key ids, and
/// provenance for both sides, plus their adapter specs. Private key
/// material must never reach this file.
fn write_pubkeys_artifact(
    out_dir: &std::path::Path,
    left_spec: &str,
    right_spec: &str,
    left: &crypto::SideKeys,
    right: &crypto::SideKeys,
) -> std::io::Result<()> {
    let mut text = String::new();
    text.push_str(&format!("L.key_id={}\n", crypto::key_id(&left.public)));
    text.push_str(&format!("L.pub_hex={}\n", hex::encode(left.public)));
    text.push_str(&format!("L.provenance={}\n", provenance_str(left.provenance)));
    text.push_str(&format!("L.spec={left_spec}\n"));
    text.push_str(&format!("R.key_id={}\n", crypto::key_id(&right.public)));
    text.push_str(&format!("R.pub_hex={}\n", hex::encode(right.public)));
    text.push_str(&format!("R.provenance={}\n", provenance_str(right.provenance)));
    text.push_str(&format!("R.spec={right_spec}\n"));
    std::fs::write(out_dir.join("pubkeys.txt"), text)
}

fn require_mode_supported(
    mode: &str,
    left: AdapterCapabilities,
    right: AdapterCapabilities,
) -> Result<(), DryBoxError> {
    if left.supports_mode(mode) && right.supports_mode(mode) {
        Ok(())
    } else {
        Err(DryBoxError::Engine(EngineError::CapabilityMismatch {
            mode: mode.to_string(),
            side: if !left.supports_mode(mode) {
                "left".to_string()
            } else {
                "right".to_string()
            },
        }))
    }
}
