//! SAR-lite: a 3-byte segmentation-and-reassembly framing protocol for
//! carrying variable-size SDUs over a bounded-MTU datagram bearer.

use std::collections::HashMap;

use crate::errors::SarError;

pub const HEADER_LEN: usize = 3;

/// Stateful, per-direction fragmenter. `frag_id` increments modulo 256 per
/// SDU fragmented, independent of fragment count.
#[derive(Debug, Clone)]
pub struct SarFragmenter {
    mtu_bytes: usize,
    frag_id: u8,
}

impl SarFragmenter {
    pub fn new(mtu_bytes: usize) -> Result<Self, SarError> {
        if mtu_bytes <= HEADER_LEN {
            return Err(SarError::MtuTooSmall {
                mtu: mtu_bytes,
                header_len: HEADER_LEN,
            });
        }
        Ok(Self {
            mtu_bytes,
            frag_id: 0,
        })
    }

    /// Split `sdu` into wire fragments, each carrying a 3-byte header. A
    /// single-fragment SDU still carries a header with `idx=0, last=1`.
    pub fn fragment(&mut self, sdu: &[u8]) -> Vec<Vec<u8>> {
        let cap = self.mtu_bytes - HEADER_LEN;
        if sdu.len() <= cap {
            let mut out = Vec::with_capacity(HEADER_LEN + sdu.len());
            out.push(self.frag_id);
            out.push(0);
            out.push(1);
            out.extend_from_slice(sdu);
            self.frag_id = self.frag_id.wrapping_add(1);
            return vec![out];
        }

        let fid = self.frag_id;
        self.frag_id = self.frag_id.wrapping_add(1);
        let n = (sdu.len() + cap - 1) / cap;
        let mut fragments = Vec::with_capacity(n);
        for idx in 0..n {
            let begin = idx * cap;
            let end = (begin + cap).min(sdu.len());
            let last = if idx == n - 1 { 1 } else { 0 };
            let mut frag = Vec::with_capacity(HEADER_LEN + (end - begin));
            frag.push(fid);
            frag.push(idx as u8);
            frag.push(last);
            frag.extend_from_slice(&sdu[begin..end]);
            fragments.push(frag);
        }
        fragments
    }
}

struct ReassemblyGroup {
    start_ms: u64,
    last_idx: Option<u8>,
    parts: HashMap<u8, Vec<u8>>,
}

/// Per-direction reassembler. When `expect_header` is false (SAR inactive,
/// MTU at least as large as the maximum SDU) it passes input through
/// unchanged.
pub struct SarReassembler {
    groups: HashMap<u8, ReassemblyGroup>,
    timeout_ms: u64,
    expect_header: bool,
}

impl SarReassembler {
    pub fn new(rtt_estimate_ms: u64, expect_header: bool) -> Self {
        Self {
            groups: HashMap::new(),
            timeout_ms: rtt_estimate_ms.max(10),
            expect_header,
        }
    }

    /// Push one fragment (or whole SDU, in pass-through mode). Returns a
    /// complete SDU exactly once per group.
    pub fn push_fragment(&mut self, frag: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        if !self.expect_header {
            return Some(frag.to_vec());
        }

        if frag.len() < HEADER_LEN {
            return None;
        }

        let fid = frag[0];
        let idx = frag[1];
        let last = frag[2];
        let payload = &frag[HEADER_LEN..];

        self.evict_timeouts(now_ms);

        let group = self.groups.entry(fid).or_insert_with(|| ReassemblyGroup {
            start_ms: now_ms,
            last_idx: None,
            parts: HashMap::new(),
        });

        if last == 1 {
            group.last_idx = Some(idx);
        }
        group.parts.insert(idx, payload.to_vec());

        if let Some(last_idx) = group.last_idx {
            let needed = last_idx as usize + 1;
            if (0..needed).all(|i| group.parts.contains_key(&(i as u8))) {
                let mut sdu = Vec::new();
                for i in 0..needed {
                    sdu.extend_from_slice(&group.parts[&(i as u8)]);
                }
                self.groups.remove(&fid);
                return Some(sdu);
            }
        }

        None
    }

    fn evict_timeouts(&mut self, now_ms: u64) {
        self.groups
            .retain(|_, grp| now_ms.saturating_sub(grp.start_ms) < self.timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_fragment_round_trip() {
        let mut frag = SarFragmenter::new(1500).unwrap();
        let mut reasm = SarReassembler::new(1000, true);

        let sdu = b"hello world".to_vec();
        let fragments = frag.fragment(&sdu);
        assert_eq!(fragments.len(), 1);

        let out = reasm.push_fragment(&fragments[0], 0);
        assert_eq!(out, Some(sdu));
    }

    #[test]
    fn multi_fragment_round_trip_mtu_10() {
        let mut frag = SarFragmenter::new(10).unwrap();
        let mut reasm = SarReassembler::new(1000, true);

        let sdu: Vec<u8> = (0u8..25).collect();
        let fragments = frag.fragment(&sdu);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].len(), 3 + 7);
        assert_eq!(fragments[1].len(), 3 + 7);
        assert_eq!(fragments[2].len(), 3 + 11);

        let mut out = None;
        for f in &fragments {
            out = reasm.push_fragment(f, 0);
        }
        assert_eq!(out, Some(sdu));
    }

    #[test]
    fn out_of_order_fragments_still_reassemble() {
        let mut frag = SarFragmenter::new(10).unwrap();
        let mut reasm = SarReassembler::new(1000, true);

        let sdu: Vec<u8> = (0u8..25).collect();
        let mut fragments = frag.fragment(&sdu);
        fragments.swap(0, 2);

        let mut out = None;
        for f in &fragments {
            let r = reasm.push_fragment(f, 0);
            if r.is_some() {
                out = r;
            }
        }
        assert_eq!(out, Some(sdu));
    }

    #[test]
    fn missing_fragment_never_emits_and_is_evicted() {
        let mut frag = SarFragmenter::new(10).unwrap();
        let mut reasm = SarReassembler::new(50, true);

        let sdu: Vec<u8> = (0u8..25).collect();
        let fragments = frag.fragment(&sdu);

        // drop the middle fragment
        assert!(reasm.push_fragment(&fragments[0], 0).is_none());
        assert!(reasm.push_fragment(&fragments[2], 10).is_none());

        // after the timeout elapses, the late middle fragment still doesn't complete anything
        let late = reasm.push_fragment(&fragments[1], 1000);
        assert!(late.is_none());
    }

    #[test]
    fn too_short_fragment_is_dropped() {
        let mut reasm = SarReassembler::new(1000, true);
        assert!(reasm.push_fragment(&[1, 2], 0).is_none());
    }

    #[test]
    fn passthrough_mode_returns_input_unchanged() {
        let mut reasm = SarReassembler::new(1000, false);
        let data = vec![9, 9, 9, 9];
        assert_eq!(reasm.push_fragment(&data, 0), Some(data));
    }

    #[test]
    fn frag_id_wraps_modulo_256() {
        let mut frag = SarFragmenter::new(1500).unwrap();
        for _ in 0..256 {
            let _ = frag.fragment(b"x");
        }
        let wrapped = frag.fragment(b"y");
        assert_eq!(wrapped[0][0], 0);
    }
}
