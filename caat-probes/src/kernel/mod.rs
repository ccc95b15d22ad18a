//! Boundary between the agent and the kernel tracing subsystem.
//!
//! Everything that allocates kernel-resident state (verified programs, map
//! memory, live links) goes through [`KernelBackend`]. The agent ships the
//! aya-backed implementation in [`bpf`] and an in-process one in [`sim`].

pub mod bpf;
pub mod sim;

use crate::errors::CaatError;
use crate::probes::HookSpec;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleId(pub u64);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bundle-{}", self.0)
    }
}

/// Backend-assigned identifier of one live hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// Compiled instrumentation bundle, either on disk or already in memory.
#[derive(Debug, Clone)]
pub enum Artifact {
    Path(PathBuf),
    Bytes { name: String, data: Bytes },
}

impl Artifact {
    pub fn name(&self) -> String {
        match self {
            Artifact::Path(p) => p.display().to_string(),
            Artifact::Bytes { name, .. } => name.clone(),
        }
    }
}

/// What the backend reports after a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedBundle {
    pub id: BundleId,
    pub programs: Vec<String>,
    pub maps: Vec<String>,
}

/// One record as it came out of a kernel buffer map. `cpu` is set when the
/// buffer is per-CPU (perf arrays).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEventRecord {
    pub cpu: Option<u32>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Records the kernel side dropped since the previous read.
    pub lost: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    /// Upper bound on records returned by a single `read_batch`.
    pub batch_size: usize,
    /// Pages per CPU when opening perf event arrays.
    pub perf_pages: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            batch_size: 64,
            perf_pages: 128,
        }
    }
}

/// Readable end of a kernel buffer map.
pub trait RecordSource: Send + 'static {
    /// Waits for records and appends them to `out` in arrival order.
    ///
    /// Cancel safe: if the returned future is dropped before completion no
    /// record has been consumed from the map.
    fn read_batch(
        &mut self,
        out: &mut Vec<RawEventRecord>,
    ) -> impl Future<Output = Result<ReadStats, CaatError>> + Send;
}

pub trait KernelBackend: Send + Sync + 'static {
    type Source: RecordSource;

    fn load(&self, artifact: &Artifact) -> Result<LoadedBundle, CaatError>;

    /// Releases every kernel resource of the bundle. Unknown ids are a no-op.
    fn unload(&self, bundle: BundleId) -> Result<(), CaatError>;

    fn attach(&self, bundle: BundleId, program: &str, hook: &HookSpec)
        -> Result<LinkId, CaatError>;

    /// Removes a hook. Unknown or already removed links are a no-op.
    fn detach(&self, bundle: BundleId, link: LinkId) -> Result<(), CaatError>;

    fn open_buffer(
        &self,
        bundle: BundleId,
        map: &str,
        opts: &BufferOptions,
    ) -> Result<Self::Source, CaatError>;
}
