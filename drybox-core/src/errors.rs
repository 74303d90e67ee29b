//! DryBox error types with granular categories

use thiserror::Error;

/// Top-level error type for all DryBox operations
#[derive(Debug, Error)]
pub enum DryBoxError {
    #[error("scenario error: {0}")]
    Scenario(#[from] ScenarioError),

    #[error("SAR error: {0}")]
    Sar(#[from] SarError),

    #[error("bearer error: {0}")]
    Bearer(#[from] BearerError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("vocoder error: {0}")]
    Vocoder(#[from] VocoderError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl DryBoxError {
    /// Process exit code this error maps to, per the engine's exit-code contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            DryBoxError::Scenario(_) => 4,
            DryBoxError::Engine(EngineError::CapabilityMismatch { .. }) => 3,
            DryBoxError::Adapter(_) => 1,
            DryBoxError::Capture(_) | DryBoxError::Metrics(_) => 2,
            _ => 1,
        }
    }
}

/// Scenario parsing/validation errors
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("{field} must be an integer, got: {value}")]
    MustBeInteger { field: String, value: String },

    #[error("{field} must be a number or a list of numbers, got: {value}")]
    MustBeNumberOrList { field: String, value: String },

    #[error("mode must be 'audio' or 'byte', got: {value}")]
    InvalidMode { value: String },

    #[error("bearer.type is required")]
    MissingBearerType,

    #[error("mtu_bytes must be greater than {min} (SAR header size), got: {actual}")]
    MtuTooSmall { min: usize, actual: i64 },

    #[error("cannot parse scenario document: {reason}")]
    MalformedDocument { reason: String },

    #[error("unknown bearer type: {kind}")]
    UnknownBearerType { kind: String },
}

/// SAR fragmenter/reassembler errors (construction-time only; runtime fragment
/// errors are silently dropped per the spec, not surfaced as `Result::Err`)
#[derive(Debug, Error)]
pub enum SarError {
    #[error("mtu must be greater than the {header_len}-byte SAR header, got {mtu}")]
    MtuTooSmall { mtu: usize, header_len: usize },
}

/// Bearer model errors
#[derive(Debug, Error)]
pub enum BearerError {
    #[error("unknown bearer type: {kind}")]
    UnknownKind { kind: String },
}

/// Channel model errors (audio mode)
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown channel type: {kind}")]
    UnknownKind { kind: String },

    #[error("invalid SNR: {snr_db} dB (must be finite)")]
    InvalidSnr { snr_db: f64 },
}

/// Vocoder model errors (audio mode)
#[derive(Debug, Error)]
pub enum VocoderError {
    #[error("unknown vocoder type: {kind}")]
    UnknownKind { kind: String },
}

/// Key derivation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cannot parse supplied private key: {reason}")]
    InvalidPrivateKey { reason: String },

    #[error("supplied private key has invalid length: {len} bytes (expected 32 or 64)")]
    InvalidPrivateKeyLength { len: usize },

    #[error("cannot read key material from path: {path}")]
    KeyFileUnreadable { path: String },
}

/// Adapter resolution errors
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no adapter registered for spec: {spec}")]
    NotFound { spec: String },

    #[error("ambiguous adapter spec: {spec}")]
    AmbiguousSpec { spec: String },

    #[error("adapter spec is malformed: {spec}")]
    MalformedSpec { spec: String },
}

/// Capture writer errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Metrics writer errors
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("event serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Simulation engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("capability mismatch: mode {mode} not supported by {side}")]
    CapabilityMismatch { mode: String, side: String },

    #[error("adapter runtime error on {side} in {callback}: {reason}")]
    AdapterRuntime {
        side: String,
        callback: String,
        reason: String,
    },
}

/// Result type alias for DryBox operations
pub type Result<T> = std::result::Result<T, DryBoxError>;
