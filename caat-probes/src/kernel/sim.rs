//! In-process kernel stand-in.
//!
//! Used by the test-suite and by `features.dry_run` to exercise the whole
//! lifecycle on hosts without BPF privileges. Artifacts are a plain-text
//! table of contents:
//!
//! ```text
//! caat-bundle v1
//! program trace_openat
//! map EVENTS
//! ```

use super::{
    Artifact, BufferOptions, BundleId, KernelBackend, LinkId, LoadedBundle, RawEventRecord,
    ReadStats, RecordSource,
};
use crate::errors::CaatError;
use crate::probes::HookSpec;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub const SIM_MAGIC: &str = "caat-bundle v1";

/// Buffer map depth used unless overridden with [`SimBackend::with_buffer_capacity`].
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFailure {
    InvalidArtifact,
    KernelUnsupported,
    PermissionDenied,
}

impl SimFailure {
    fn to_error(self) -> CaatError {
        match self {
            SimFailure::InvalidArtifact => {
                CaatError::InvalidArtifact("verifier rejected program".to_string())
            }
            SimFailure::KernelUnsupported => {
                CaatError::KernelUnsupported("BPF ring buffer".to_string())
            }
            SimFailure::PermissionDenied => {
                CaatError::PermissionDenied("CAP_BPF required".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimTable {
    pub programs: Vec<String>,
    pub maps: Vec<String>,
}

impl SimTable {
    pub fn parse(data: &[u8]) -> Result<SimTable, CaatError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CaatError::InvalidArtifact("table of contents is not UTF-8".into()))?;

        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        if lines.next() != Some(SIM_MAGIC) {
            return Err(CaatError::InvalidArtifact(format!(
                "missing '{}' header",
                SIM_MAGIC
            )));
        }

        let mut table = SimTable::default();
        let mut seen = HashSet::new();
        for line in lines {
            let (directive, name) = match line.split_once(char::is_whitespace) {
                Some((d, n)) if !n.trim().is_empty() => (d, n.trim()),
                _ => {
                    return Err(CaatError::InvalidArtifact(format!(
                        "malformed entry '{}'",
                        line
                    )))
                }
            };
            if !seen.insert(name.to_string()) {
                return Err(CaatError::InvalidArtifact(format!(
                    "duplicate entry '{}'",
                    name
                )));
            }
            match directive {
                "program" => table.programs.push(name.to_string()),
                "map" => table.maps.push(name.to_string()),
                _ => {
                    return Err(CaatError::InvalidArtifact(format!(
                        "unknown directive '{}'",
                        directive
                    )))
                }
            }
        }
        Ok(table)
    }

    pub fn render(&self) -> String {
        let mut s = String::from(SIM_MAGIC);
        s.push('\n');
        for p in &self.programs {
            s.push_str(&format!("program {}\n", p));
        }
        for m in &self.maps {
            s.push_str(&format!("map {}\n", m));
        }
        s
    }
}

/// Creates a bounded buffer map. Writes into a full buffer are counted as
/// kernel-side loss, the way a real ring buffer drops on reserve failure.
pub fn buffer(capacity: usize, batch_size: usize) -> (SimWriter, SimSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let lost = Arc::new(AtomicU64::new(0));
    (
        SimWriter {
            tx,
            lost: lost.clone(),
        },
        SimSource {
            rx,
            lost,
            batch_size: batch_size.max(1),
        },
    )
}

#[derive(Debug, Clone)]
pub struct SimWriter {
    tx: mpsc::Sender<RawEventRecord>,
    lost: Arc<AtomicU64>,
}

impl SimWriter {
    pub fn write(&self, cpu: Option<u32>, data: impl Into<Bytes>) -> bool {
        let record = RawEventRecord {
            cpu,
            data: data.into(),
        };
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(_) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct SimSource {
    rx: mpsc::Receiver<RawEventRecord>,
    lost: Arc<AtomicU64>,
    batch_size: usize,
}

impl RecordSource for SimSource {
    async fn read_batch(&mut self, out: &mut Vec<RawEventRecord>) -> Result<ReadStats, CaatError> {
        let first = self
            .rx
            .recv()
            .await
            .ok_or_else(|| CaatError::KernelIo("buffer map closed".to_string()))?;
        out.push(first);

        let mut read = 1;
        while read < self.batch_size {
            match self.rx.try_recv() {
                Ok(r) => {
                    out.push(r);
                    read += 1;
                }
                Err(_) => break,
            }
        }

        Ok(ReadStats {
            lost: self.lost.swap(0, Ordering::Relaxed),
        })
    }
}

struct SimMap {
    writer: SimWriter,
    source: Option<SimSource>,
}

struct SimBundle {
    programs: Vec<String>,
    maps: HashMap<String, SimMap>,
}

struct SimLink {
    bundle: BundleId,
    target: String,
}

#[derive(Default)]
struct SimState {
    bundles: HashMap<BundleId, SimBundle>,
    links: HashMap<LinkId, SimLink>,
    fixed_table: Option<SimTable>,
    load_failure: Option<SimFailure>,
    attach_failures: HashSet<String>,
    detach_failures: HashSet<String>,
}

pub struct SimBackend {
    buffer_capacity: usize,
    next_id: AtomicU64,
    state: Mutex<SimState>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    pub fn new() -> SimBackend {
        SimBackend {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            next_id: AtomicU64::new(1),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> SimBackend {
        self.buffer_capacity = capacity;
        self
    }

    /// Ignores artifact contents and always loads `table`.
    pub fn with_table(self, table: SimTable) -> SimBackend {
        self.state.lock().fixed_table = Some(table);
        self
    }

    pub fn fail_load(&self, failure: SimFailure) {
        self.state.lock().load_failure = Some(failure);
    }

    /// Makes attaching to `target` (see [`HookSpec::target`]) fail.
    pub fn fail_attach(&self, target: &str) {
        self.state.lock().attach_failures.insert(target.to_string());
    }

    pub fn fail_detach(&self, target: &str) {
        self.state.lock().detach_failures.insert(target.to_string());
    }

    /// Pushes a record into `map` of the most recently loaded bundle that has it.
    pub fn emit(&self, map: &str, cpu: Option<u32>, data: impl Into<Bytes>) -> bool {
        let state = self.state.lock();
        let newest = state
            .bundles
            .iter()
            .filter(|(_, b)| b.maps.contains_key(map))
            .max_by_key(|(id, _)| **id);

        match newest {
            Some((_, b)) => b.maps[map].writer.write(cpu, data),
            None => false,
        }
    }

    /// Programs, maps and links currently held "in the kernel".
    pub fn live_resources(&self) -> usize {
        let state = self.state.lock();
        let per_bundle: usize = state
            .bundles
            .values()
            .map(|b| b.programs.len() + b.maps.len())
            .sum();
        per_bundle + state.links.len()
    }

    pub fn live_links(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn loaded_bundles(&self) -> usize {
        self.state.lock().bundles.len()
    }

    fn read_table(&self, artifact: &Artifact) -> Result<SimTable, CaatError> {
        if let Some(table) = &self.state.lock().fixed_table {
            return Ok(table.clone());
        }

        match artifact {
            Artifact::Bytes { data, .. } => SimTable::parse(data),
            Artifact::Path(path) => {
                let data = std::fs::read(path).map_err(|e| match e.kind() {
                    io::ErrorKind::PermissionDenied => {
                        CaatError::PermissionDenied(format!("{}: {}", path.display(), e))
                    }
                    _ => CaatError::InvalidArtifact(format!("{}: {}", path.display(), e)),
                })?;
                SimTable::parse(&data)
            }
        }
    }
}

impl KernelBackend for SimBackend {
    type Source = SimSource;

    fn load(&self, artifact: &Artifact) -> Result<LoadedBundle, CaatError> {
        if let Some(failure) = self.state.lock().load_failure {
            return Err(failure.to_error());
        }

        let table = self.read_table(artifact)?;
        let id = BundleId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let maps = table
            .maps
            .iter()
            .map(|m| {
                let (writer, source) = buffer(self.buffer_capacity, usize::MAX);
                (
                    m.clone(),
                    SimMap {
                        writer,
                        source: Some(source),
                    },
                )
            })
            .collect();

        self.state.lock().bundles.insert(
            id,
            SimBundle {
                programs: table.programs.clone(),
                maps,
            },
        );
        debug!("sim: loaded {} as {}", artifact.name(), id);

        Ok(LoadedBundle {
            id,
            programs: table.programs,
            maps: table.maps,
        })
    }

    fn unload(&self, bundle: BundleId) -> Result<(), CaatError> {
        let mut state = self.state.lock();
        if state.bundles.remove(&bundle).is_some() {
            state.links.retain(|_, l| l.bundle != bundle);
            debug!("sim: unloaded {}", bundle);
        }
        Ok(())
    }

    fn attach(
        &self,
        bundle: BundleId,
        program: &str,
        hook: &HookSpec,
    ) -> Result<LinkId, CaatError> {
        let mut state = self.state.lock();
        let loaded = state
            .bundles
            .get(&bundle)
            .ok_or_else(|| CaatError::KernelIo(format!("{} is not loaded", bundle)))?;

        if !loaded.programs.iter().any(|p| p == program) {
            return Err(CaatError::ProgramNotFound {
                program: program.to_string(),
            });
        }

        let target = hook.target();
        if state.attach_failures.contains(&target) {
            return Err(CaatError::KernelIo(format!("attach to {} rejected", target)));
        }

        let link = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.links.insert(link, SimLink { bundle, target });
        Ok(link)
    }

    fn detach(&self, _bundle: BundleId, link: LinkId) -> Result<(), CaatError> {
        let mut state = self.state.lock();
        let target = match state.links.get(&link) {
            Some(l) => l.target.clone(),
            None => return Ok(()),
        };

        if state.detach_failures.contains(&target) {
            return Err(CaatError::KernelIo(format!(
                "detach from {} failed",
                target
            )));
        }

        state.links.remove(&link);
        Ok(())
    }

    fn open_buffer(
        &self,
        bundle: BundleId,
        map: &str,
        opts: &BufferOptions,
    ) -> Result<SimSource, CaatError> {
        let mut state = self.state.lock();
        let sim_map = state
            .bundles
            .get_mut(&bundle)
            .and_then(|b| b.maps.get_mut(map))
            .ok_or_else(|| CaatError::MapNotFound {
                map: map.to_string(),
            })?;

        let mut source = sim_map
            .source
            .take()
            .ok_or_else(|| CaatError::KernelIo(format!("map {} already opened", map)))?;
        source.batch_size = opts.batch_size.max(1);
        Ok(source)
    }
}
