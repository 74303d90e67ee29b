//! Reference adapter implementations, registered into the compiled-in
//! `AdapterRegistry` under well-known names (`echo`, `tone`).
//!
//! These exist so a scenario can be driven end-to-end without external
//! adapter code: `echo` exercises byte mode by emitting a fixed-cadence SDU
//! and logging whatever it receives; `tone` exercises audio mode the same
//! way with a synthesized sine-wave frame.

use crate::adapter::{AudioBlock, ByteLink};

/// Emits a small SDU every `period_ms`, and simply counts what it receives.
pub struct EchoByteLink {
    period_ms: u64,
    payload: Vec<u8>,
    next_send_ms: u64,
    pub received_count: usize,
}

impl EchoByteLink {
    pub fn new(period_ms: u64, payload: Vec<u8>) -> Self {
        Self {
            period_ms,
            payload,
            next_send_ms: 0,
            received_count: 0,
        }
    }
}

impl ByteLink for EchoByteLink {
    fn on_timer(&mut self, _now_ms: u64) {}

    fn on_link_tx(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if now_ms >= self.next_send_ms {
            self.next_send_ms = now_ms + self.period_ms;
            Some(self.payload.clone())
        } else {
            None
        }
    }

    fn on_link_rx(&mut self, _now_ms: u64, _sdu: &[u8]) {
        self.received_count += 1;
    }
}

/// Emits a synthesized sine-wave PCM frame every `frame_ms`, and counts
/// what it receives.
pub struct ToneAudioBlock {
    frame_ms: u64,
    sample_rate: u32,
    freq_hz: f64,
    next_send_ms: u64,
    phase: f64,
    pub received_count: usize,
}

impl ToneAudioBlock {
    pub fn new(frame_ms: u64, sample_rate: u32, freq_hz: f64) -> Self {
        Self {
            frame_ms,
            sample_rate,
            freq_hz,
            next_send_ms: 0,
            phase: 0.0,
            received_count: 0,
        }
    }
}

impl AudioBlock for ToneAudioBlock {
    fn on_timer(&mut self, _now_ms: u64) {}

    fn on_tx_frame(&mut self, now_ms: u64) -> Option<Vec<i16>> {
        if now_ms < self.next_send_ms {
            return None;
        }
        self.next_send_ms = now_ms + self.frame_ms;
        let n = (self.sample_rate as u64 * self.frame_ms / 1000) as usize;
        let dphase = 2.0 * std::f64::consts::PI * self.freq_hz / self.sample_rate as f64;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push((16000.0 * self.phase.sin()) as i16);
            self.phase += dphase;
        }
        Some(out)
    }

    fn on_rx_frame(&mut self, _now_ms: u64, _pcm: &[i16]) {
        self.received_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_emits_on_its_own_cadence() {
        let mut echo = EchoByteLink::new(20, vec![1, 2, 3]);
        assert!(echo.on_link_tx(0).is_some());
        assert!(echo.on_link_tx(10).is_none());
        assert!(echo.on_link_tx(20).is_some());
    }

    #[test]
    fn tone_produces_frame_of_expected_length() {
        let mut tone = ToneAudioBlock::new(20, 8000, 1000.0);
        let frame = tone.on_tx_frame(0).unwrap();
        assert_eq!(frame.len(), 160);
    }
}
