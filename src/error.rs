use thiserror::Error;

#[derive(Debug, Error)]
/// Every failure the library surfaces. Binaries map these onto exit codes:
/// unsupported hardware exits 2, everything else exits 1.
pub enum Error {
    /// The host cannot run the requested diagnostic at all (no invariant
    /// TSC, no usable CPUID range).
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(&'static str),

    /// The host refused an affinity or scheduling request.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A logical CPU index beyond the enumerated processor count.
    #[error("logical CPU {index} out of range (host has {count})")]
    CpuOutOfRange { index: usize, count: usize },

    /// No thread-affinity API on this platform.
    #[error("thread affinity is not supported on this platform")]
    AffinityUnsupported,

    /// A dump line that matches none of the format's line shapes.
    #[error("dump parse error at line {line}: {content:?}")]
    ParseDump { line: usize, content: String },

    /// A flag specification the grammar rejects.
    #[error("malformed flag spec {spec:?}: {reason}")]
    ParseFlag { spec: String, reason: &'static str },

    /// A flag spec naming a mnemonic the catalogue does not carry.
    #[error("unknown feature mnemonic {0:?}")]
    CatalogueMiss(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this failure, per the command surface contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnsupportedHardware(_) => 2,
            _ => 1,
        }
    }
}
