//! Adapter ABI and a compiled-in registry resolving scenario adapter specs
//! to constructors.
//!
//! The Python reference dynamically imports adapter modules at runtime
//! (filesystem paths, `pkg:`/`entrypoint:` specs, bare names resolved
//! against an adapters directory). A Rust port can't load unknown code at
//! runtime without real plugin infrastructure (dlopen, WASM), so this
//! module keeps the spec-string vocabulary but resolves it against a
//! compiled-in registry of adapter constructors instead.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use crate::crypto::Provenance;
use crate::errors::AdapterError;

/// Audio block parameters (sample rate, block size) an adapter declares for
/// audio mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sr: u32,
    pub block: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self { sr: 8_000, block: 160 }
    }
}

/// What an adapter can exchange with the link under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub byte_link: bool,
    pub audio_block: bool,
    pub sdu_max_bytes: u32,
    pub audioparams: AudioParams,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            byte_link: false,
            audio_block: false,
            sdu_max_bytes: 1024,
            audioparams: AudioParams::default(),
        }
    }
}

impl AdapterCapabilities {
    pub fn supports_mode(&self, mode: &str) -> bool {
        match mode {
            "byte" => self.byte_link,
            "audio" => self.audio_block,
            _ => false,
        }
    }
}

/// Which endpoint of the link an adapter instance occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    L,
    R,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::L => write!(f, "L"),
            Side::R => write!(f, "R"),
        }
    }
}

/// The scenario-derived crypto material handed to one side's adapter at
/// `start`: its own keypair, the peer's public key, both key ids, and
/// whether this side's private key came from the scenario or was derived.
#[derive(Debug, Clone)]
pub struct AdapterCrypto {
    pub priv_key: [u8; 32],
    pub public: [u8; 32],
    pub peer_pub: [u8; 32],
    pub key_id: String,
    pub peer_key_id: String,
    pub provenance: Provenance,
}

/// Shared (t_ms, type, payload) events emitted by an adapter via
/// `AdapterContext::emit_event`, drained into `events.jsonl` by the engine
/// once per tick.
pub type EmittedEvents = Rc<RefCell<VecDeque<(u64, String, Value)>>>;

/// Passed to each adapter at `start`. Exposes the same surface the Python
/// reference's per-side context object does: the current simulation time,
/// an event-emission hook, which side this is, a seeded RNG distinct from
/// the engine's own draw sequence, and this side's crypto material.
pub struct AdapterContext {
    clock: Rc<Cell<u64>>,
    events: EmittedEvents,
    pub side: Side,
    pub rng: ChaCha8Rng,
    pub crypto: AdapterCrypto,
}

impl AdapterContext {
    pub(crate) fn new(
        clock: Rc<Cell<u64>>,
        events: EmittedEvents,
        side: Side,
        rng: ChaCha8Rng,
        crypto: AdapterCrypto,
    ) -> Self {
        Self {
            clock,
            events,
            side,
            rng,
            crypto,
        }
    }

    /// Current simulation time, as of the start of the tick in progress.
    pub fn now_ms(&self) -> u64 {
        self.clock.get()
    }

    /// Queue a structured event for `events.jsonl`. Drained by the engine
    /// at the end of the tick it was emitted in.
    pub fn emit_event(&self, kind: impl Into<String>, payload: Value) {
        self.events
            .borrow_mut()
            .push_back((self.clock.get(), kind.into(), payload));
    }
}

/// Datagram-oriented adapter surface (byte mode).
pub trait ByteLink {
    /// Called once per engine tick, before any TX/RX processing.
    fn on_timer(&mut self, now_ms: u64);
    /// Pull the next outbound SDU, if the adapter has one ready.
    fn on_link_tx(&mut self, now_ms: u64) -> Option<Vec<u8>>;
    /// Deliver a reassembled inbound SDU to the adapter.
    fn on_link_rx(&mut self, now_ms: u64, sdu: &[u8]);
    fn start(&mut self, _ctx: AdapterContext) {}
    fn stop(&mut self) {}
    /// Declared capabilities. Adapters needing a non-default `sdu_max_bytes`
    /// (to trigger SAR fragmentation below the bearer MTU) override this.
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            byte_link: true,
            ..AdapterCapabilities::default()
        }
    }
}

/// Sample-block-oriented adapter surface (audio mode).
pub trait AudioBlock {
    fn on_timer(&mut self, now_ms: u64);
    /// Pull the next outbound PCM frame, if the adapter has one ready.
    fn on_tx_frame(&mut self, now_ms: u64) -> Option<Vec<i16>>;
    /// Deliver a decoded inbound PCM frame to the adapter (`None` on loss,
    /// handled upstream by the vocoder's PLC before this call).
    fn on_rx_frame(&mut self, now_ms: u64, pcm: &[i16]);
    fn start(&mut self, _ctx: AdapterContext) {}
    fn stop(&mut self) {}
    /// Declared capabilities. Adapters needing a non-default sample rate or
    /// block size override this.
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            audio_block: true,
            ..AdapterCapabilities::default()
        }
    }
}

/// An instantiated adapter, tagged with its declared capabilities.
pub enum AdapterInstance {
    Byte(Box<dyn ByteLink>),
    Audio(Box<dyn AudioBlock>),
}

impl AdapterInstance {
    pub fn capabilities(&self) -> AdapterCapabilities {
        match self {
            AdapterInstance::Byte(a) => a.capabilities(),
            AdapterInstance::Audio(a) => a.capabilities(),
        }
    }

    pub fn start(&mut self, ctx: AdapterContext) {
        match self {
            AdapterInstance::Byte(a) => a.start(ctx),
            AdapterInstance::Audio(a) => a.start(ctx),
        }
    }

    pub fn stop(&mut self) {
        match self {
            AdapterInstance::Byte(a) => a.stop(),
            AdapterInstance::Audio(a) => a.stop(),
        }
    }
}

impl fmt::Debug for AdapterInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterInstance::Byte(_) => write!(f, "AdapterInstance::Byte"),
            AdapterInstance::Audio(_) => write!(f, "AdapterInstance::Audio"),
        }
    }
}

type Constructor = Box<dyn Fn() -> AdapterInstance + Send + Sync>;

/// Compiled-in registry mapping adapter spec strings (e.g. `builtin:echo`)
/// to constructors, resolved entirely at compile time.
#[derive(Default)]
pub struct AdapterRegistry {
    constructors: HashMap<String, Constructor>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, identifier: impl Into<String>, ctor: Constructor) {
        self.constructors.insert(identifier.into(), ctor);
    }

    /// Resolve a scenario-supplied adapter spec to an instance.
    ///
    /// Accepts `builtin:<name>` and bare `<name>` forms (mirroring the
    /// Python source's bare-filename-resolved-against-an-adapters-dir
    /// convenience); any `entrypoint:`/`pkg:`/filesystem-path spec is
    /// rejected as unsupported, since this registry has nothing to load at
    /// runtime.
    pub fn resolve(&self, spec: &str) -> Result<AdapterInstance, AdapterError> {
        let name = split_spec(spec)?;
        match self.constructors.get(name) {
            Some(ctor) => Ok(ctor()),
            None => Err(AdapterError::NotFound {
                spec: spec.to_string(),
            }),
        }
    }
}

fn split_spec(spec: &str) -> Result<&str, AdapterError> {
    if spec.is_empty() {
        return Err(AdapterError::MalformedSpec {
            spec: spec.to_string(),
        });
    }
    if let Some(rest) = spec.strip_prefix("builtin:") {
        if rest.is_empty() {
            return Err(AdapterError::MalformedSpec {
                spec: spec.to_string(),
            });
        }
        return Ok(rest);
    }
    if spec.starts_with("entrypoint:") || spec.starts_with("pkg:") || spec.contains('/') {
        return Err(AdapterError::MalformedSpec {
            spec: spec.to_string(),
        });
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullByte;
    impl ByteLink for NullByte {
        fn on_timer(&mut self, _now_ms: u64) {}
        fn on_link_tx(&mut self, _now_ms: u64) -> Option<Vec<u8>> {
            None
        }
        fn on_link_rx(&mut self, _now_ms: u64, _sdu: &[u8]) {}
    }

    fn test_registry() -> AdapterRegistry {
        let mut reg = AdapterRegistry::new();
        reg.register("echo", Box::new(|| AdapterInstance::Byte(Box::new(NullByte))));
        reg
    }

    #[test]
    fn resolves_bare_name() {
        let reg = test_registry();
        let inst = reg.resolve("echo").unwrap();
        assert!(inst.capabilities().byte_link);
    }

    #[test]
    fn resolves_builtin_prefixed_name() {
        let reg = test_registry();
        let inst = reg.resolve("builtin:echo").unwrap();
        assert!(inst.capabilities().byte_link);
    }

    #[test]
    fn unknown_spec_is_not_found() {
        let reg = test_registry();
        assert!(matches!(
            reg.resolve("nonexistent"),
            Err(AdapterError::NotFound { .. })
        ));
    }

    #[test]
    fn entrypoint_and_filesystem_specs_are_rejected() {
        let reg = test_registry();
        assert!(matches!(
            reg.resolve("entrypoint:pkg.module:Class"),
            Err(AdapterError::MalformedSpec { .. })
        ));
        assert!(matches!(
            reg.resolve("./adapters/custom.py"),
            Err(AdapterError::MalformedSpec { .. })
        ));
    }

    #[test]
    fn empty_spec_is_malformed() {
        let reg = test_registry();
        assert!(matches!(
            reg.resolve(""),
            Err(AdapterError::MalformedSpec { .. })
        ));
    }

    #[test]
    fn capability_check_matches_mode() {
        let caps = AdapterCapabilities {
            byte_link: true,
            ..AdapterCapabilities::default()
        };
        assert!(caps.supports_mode("byte"));
        assert!(!caps.supports_mode("audio"));
    }

    #[test]
    fn context_now_ms_reflects_shared_clock() {
        use rand::SeedableRng;

        let clock = Rc::new(Cell::new(0));
        let events: EmittedEvents = Rc::new(RefCell::new(VecDeque::new()));
        let ctx = AdapterContext::new(
            clock.clone(),
            events.clone(),
            Side::L,
            ChaCha8Rng::seed_from_u64(1),
            AdapterCrypto {
                priv_key: [0; 32],
                public: [1; 32],
                peer_pub: [2; 32],
                key_id: "aaaaaaaa".to_string(),
                peer_key_id: "bbbbbbbb".to_string(),
                provenance: Provenance::Derived,
            },
        );

        assert_eq!(ctx.now_ms(), 0);
        clock.set(500);
        assert_eq!(ctx.now_ms(), 500);

        ctx.emit_event("handshake_complete", serde_json::json!({"ok": true}));
        let queued = events.borrow();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, 500);
        assert_eq!(queued[0].1, "handshake_complete");
    }
}
