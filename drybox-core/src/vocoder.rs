//! Mock vocoder models (audio mode only): block encode/decode plus a shared
//! packet-loss-concealment policy.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::errors::VocoderError;

pub const FRAME_SIZE: usize = 160;

/// Packet-loss concealment shared by every vocoder: repeat-then-decay on
/// consecutive losses, silence once no recent good frame exists.
#[derive(Debug, Clone, Default)]
struct Plc {
    last_good_frame: Option<Vec<i16>>,
    consecutive_losses: u32,
}

impl Plc {
    fn apply(&mut self, frame_size: usize) -> Vec<i16> {
        let Some(last_good) = self.last_good_frame.clone() else {
            return vec![0; frame_size];
        };
        self.consecutive_losses += 1;
        match self.consecutive_losses {
            1 => last_good,
            2..=3 => {
                let attenuation = 1.0 - (self.consecutive_losses as f64 * 0.2);
                last_good
                    .iter()
                    .map(|&s| (s as f64 * attenuation) as i16)
                    .collect()
            }
            _ => vec![0; frame_size],
        }
    }

    fn process_frame(&mut self, pcm: Option<&[i16]>) -> Vec<i16> {
        match pcm {
            None => {
                let frame_size = self
                    .last_good_frame
                    .as_ref()
                    .map(|f| f.len())
                    .unwrap_or(FRAME_SIZE);
                self.apply(frame_size)
            }
            Some(pcm) => {
                self.last_good_frame = Some(pcm.to_vec());
                self.consecutive_losses = 0;
                pcm.to_vec()
            }
        }
    }
}

/// Mock codec variants. All operate on `FRAME_SIZE`-sample (20ms @ 8kHz)
/// blocks.
#[derive(Debug, Clone, Copy)]
pub enum VocoderKind {
    Amr12k2,
    Evs13k2,
    OpusNb,
}

impl VocoderKind {
    fn quantization_scale(self) -> f64 {
        match self {
            VocoderKind::Amr12k2 => 127.0,
            VocoderKind::Evs13k2 => 200.0,
            VocoderKind::OpusNb => 127.0,
        }
    }

    fn dtx_energy_threshold(self) -> f64 {
        match self {
            VocoderKind::Amr12k2 => 100.0,
            VocoderKind::Evs13k2 => 100.0,
            VocoderKind::OpusNb => 80.0,
        }
    }

    fn tag(self) -> &'static [u8; 3] {
        match self {
            VocoderKind::Amr12k2 => b"AMR",
            VocoderKind::Evs13k2 => b"EVS",
            VocoderKind::OpusNb => b"OPS",
        }
    }

    fn dtx_tag(self) -> &'static [u8; 3] {
        match self {
            VocoderKind::Amr12k2 => b"DTX",
            VocoderKind::Evs13k2 => b"EVD",
            VocoderKind::OpusNb => b"OPD",
        }
    }

    fn dtx_padding_len(self) -> usize {
        match self {
            VocoderKind::Amr12k2 => 8,
            VocoderKind::Evs13k2 => 10,
            VocoderKind::OpusNb => 12,
        }
    }

    fn default_noise_level(self) -> u8 {
        match self {
            VocoderKind::Amr12k2 => 10,
            VocoderKind::Evs13k2 => 8,
            VocoderKind::OpusNb => 5,
        }
    }

    pub fn from_str(s: &str) -> Result<Self, VocoderError> {
        match s {
            "amr12k2_mock" => Ok(VocoderKind::Amr12k2),
            "evs13k2_mock" => Ok(VocoderKind::Evs13k2),
            "opus_nb_mock" => Ok(VocoderKind::OpusNb),
            other => Err(VocoderError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A mock vocoder instance: encode/decode plus the PLC shell.
pub struct Vocoder {
    kind: VocoderKind,
    vad_dtx: bool,
    rng: ChaCha8Rng,
    plc: Plc,
}

impl Vocoder {
    pub fn new(kind: VocoderKind, vad_dtx: bool, rng: ChaCha8Rng) -> Self {
        Self {
            kind,
            vad_dtx,
            rng,
            plc: Plc::default(),
        }
    }

    /// Encode a `FRAME_SIZE`-sample PCM block to a mock bitstream.
    pub fn encode(&mut self, pcm: &[i16]) -> Vec<u8> {
        if self.vad_dtx {
            let energy = mean_square_i16(pcm);
            if energy < self.kind.dtx_energy_threshold() {
                let mut out = Vec::with_capacity(3 + self.kind.dtx_padding_len());
                out.extend_from_slice(self.kind.dtx_tag());
                out.extend(std::iter::repeat(0u8).take(self.kind.dtx_padding_len()));
                return out;
            }
        }

        let scale = self.kind.quantization_scale();
        let compressed: Vec<i8> = pcm
            .iter()
            .map(|&s| {
                let f = s as f64 / 32768.0;
                (f * scale).clamp(-128.0, 127.0) as i8
            })
            .collect();

        let mut out = Vec::with_capacity(3 + compressed.len());
        out.extend_from_slice(self.kind.tag());
        out.extend(compressed.iter().map(|&b| b as u8));
        out
    }

    /// Decode a mock bitstream back to a `FRAME_SIZE`-sample PCM block.
    pub fn decode(&mut self, bitstream: &[u8]) -> Vec<i16> {
        if bitstream.len() >= 3 && &bitstream[0..3] == self.kind.dtx_tag() {
            let noise_level = bitstream.get(3).copied().unwrap_or(0);
            let noise_level = if noise_level == 0 {
                self.kind.default_noise_level()
            } else {
                noise_level
            };
            let dist = Normal::new(0.0, noise_level as f64).unwrap();
            return (0..FRAME_SIZE)
                .map(|_| dist.sample(&mut self.rng) as i16)
                .collect();
        }

        if bitstream.len() >= 3 && &bitstream[0..3] == self.kind.tag() {
            let compressed = &bitstream[3..];
            if compressed.len() >= FRAME_SIZE {
                let scale = self.kind.quantization_scale();
                return compressed[..FRAME_SIZE]
                    .iter()
                    .map(|&b| (((b as i8) as f64 / scale) * 32767.0) as i16)
                    .collect();
            }
        }

        vec![0; FRAME_SIZE]
    }

    /// Apply PLC for a lost frame (`pcm = None`), or pass a good frame
    /// through while resetting loss-concealment state.
    pub fn process_frame(&mut self, pcm: Option<&[i16]>) -> Vec<i16> {
        self.plc.process_frame(pcm)
    }
}

fn mean_square_i16(pcm: &[i16]) -> f64 {
    if pcm.is_empty() {
        return 0.0;
    }
    pcm.iter().map(|&s| (s as f64).powi(2)).sum::<f64>() / pcm.len() as f64
}

/// Draw a Bernoulli frame-loss outcome against `loss_rate`, matching the
/// engine's per-frame audio-mode loss simulation.
pub fn draw_frame_loss(rng: &mut ChaCha8Rng, loss_rate: f64) -> bool {
    rng.gen::<f64>() < loss_rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn tone(n: usize, amp: f64) -> Vec<i16> {
        (0..n)
            .map(|i| (amp * (2.0 * std::f64::consts::PI * i as f64 / 20.0).sin()) as i16)
            .collect()
    }

    #[test]
    fn amr_round_trip_preserves_shape() {
        let mut voc = Vocoder::new(VocoderKind::Amr12k2, false, ChaCha8Rng::seed_from_u64(1));
        let pcm = tone(FRAME_SIZE, 16000.0);
        let bitstream = voc.encode(&pcm);
        assert_eq!(&bitstream[0..3], b"AMR");
        let decoded = voc.decode(&bitstream);
        assert_eq!(decoded.len(), FRAME_SIZE);
        // Reconstruction should track the original waveform's sign.
        for (orig, dec) in pcm.iter().zip(decoded.iter()).step_by(10) {
            assert_eq!(orig.signum(), dec.signum());
        }
    }

    #[test]
    fn dtx_triggers_below_energy_threshold() {
        let mut voc = Vocoder::new(VocoderKind::Amr12k2, true, ChaCha8Rng::seed_from_u64(1));
        let silence = vec![0i16; FRAME_SIZE];
        let bitstream = voc.encode(&silence);
        assert_eq!(&bitstream[0..3], b"DTX");
        assert_eq!(bitstream.len(), 3 + 8);
    }

    #[test]
    fn plc_decays_then_silences_on_consecutive_loss() {
        let mut voc = Vocoder::new(VocoderKind::Evs13k2, false, ChaCha8Rng::seed_from_u64(1));
        let good = vec![1000i16; FRAME_SIZE];
        let out0 = voc.process_frame(Some(&good));
        assert_eq!(out0, good);

        let out1 = voc.process_frame(None);
        assert_eq!(out1, good); // first loss: unchanged repeat

        let out2 = voc.process_frame(None);
        assert!(out2[0] < out0[0] && out2[0] > 0); // attenuated

        let out3 = voc.process_frame(None);
        assert!(out3[0] < out2[0]);

        let out4 = voc.process_frame(None);
        assert!(out4.iter().all(|&s| s == 0)); // silence after 4+ losses
    }

    #[test]
    fn plc_with_no_prior_frame_is_silence() {
        let mut voc = Vocoder::new(VocoderKind::OpusNb, false, ChaCha8Rng::seed_from_u64(1));
        let out = voc.process_frame(None);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn unknown_bitstream_tag_decodes_to_silence() {
        let mut voc = Vocoder::new(VocoderKind::OpusNb, false, ChaCha8Rng::seed_from_u64(1));
        let decoded = voc.decode(b"???");
        assert!(decoded.iter().all(|&s| s == 0));
    }
}
