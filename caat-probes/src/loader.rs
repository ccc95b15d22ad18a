use crate::errors::CaatError;
use crate::kernel::{Artifact, BufferOptions, BundleId, KernelBackend};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reference to one loaded program. Does not keep the program alive; once the
/// owning bundle is unloaded the backend rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramHandle {
    bundle: BundleId,
    name: Arc<str>,
}

impl ProgramHandle {
    pub fn bundle(&self) -> BundleId {
        self.bundle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapHandle {
    bundle: BundleId,
    name: Arc<str>,
}

impl MapHandle {
    pub fn bundle(&self) -> BundleId {
        self.bundle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Entry points a bundle must provide for the configured hooks and streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPoints {
    pub programs: Vec<String>,
    pub maps: Vec<String>,
}

/// Marks a program as attached for as long as it is held.
#[derive(Debug)]
pub(crate) struct AttachmentSlot {
    attached: Arc<Mutex<HashSet<String>>>,
    program: String,
}

impl Drop for AttachmentSlot {
    fn drop(&mut self) {
        self.attached.lock().remove(&self.program);
    }
}

pub struct InstrumentationBundle<B: KernelBackend> {
    backend: Arc<B>,
    id: BundleId,
    source: String,
    programs: HashMap<String, ProgramHandle>,
    maps: HashMap<String, MapHandle>,
    attached: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl<B: KernelBackend> InstrumentationBundle<B> {
    pub fn id(&self) -> BundleId {
        self.id
    }

    pub fn program(&self, name: &str) -> Option<&ProgramHandle> {
        self.programs.get(name)
    }

    pub fn map(&self, name: &str) -> Option<&MapHandle> {
        self.maps.get(name)
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn live_attachments(&self) -> usize {
        self.attached.lock().len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Claims `program` for a new attachment. At most one live attachment per
    /// program, which keeps attachments bounded by the program count.
    pub(crate) fn reserve(&self, program: &str) -> Result<AttachmentSlot, CaatError> {
        if self.released {
            return Err(CaatError::KernelIo(format!("{} is unloaded", self.id)));
        }
        if !self.programs.contains_key(program) {
            return Err(CaatError::ProgramNotFound {
                program: program.to_string(),
            });
        }
        if !self.attached.lock().insert(program.to_string()) {
            return Err(CaatError::ProgramAlreadyAttached {
                program: program.to_string(),
            });
        }
        Ok(AttachmentSlot {
            attached: self.attached.clone(),
            program: program.to_string(),
        })
    }

    /// Opens the readable end of a buffer map. Each map can be opened once.
    pub fn open_buffer(&self, map: &str, opts: &BufferOptions) -> Result<B::Source, CaatError> {
        let handle = self.maps.get(map).ok_or_else(|| CaatError::MapNotFound {
            map: map.to_string(),
        })?;
        self.backend.open_buffer(self.id, handle.name(), opts)
    }

    fn release(&mut self) -> Result<(), CaatError> {
        if self.released {
            return Ok(());
        }
        let attachments = self.live_attachments();
        if attachments > 0 {
            return Err(CaatError::BundleInUse {
                bundle: self.id,
                attachments,
            });
        }
        self.backend.unload(self.id)?;
        self.released = true;
        info!("Unloaded {} ({})", self.id, self.source);
        Ok(())
    }
}

impl<B: KernelBackend> Drop for InstrumentationBundle<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let attachments = self.live_attachments();
        if attachments > 0 {
            error!(target: "error", "{} dropped with {} live attachment(s), kernel resources left in place", self.id, attachments);
            return;
        }
        warn!(target: "error", "{} dropped without unload, releasing", self.id);
        if let Err(e) = self.release() {
            error!(target: "error", "Could not release {}: {}", self.id, e);
        }
    }
}

pub struct ArtifactLoader<B: KernelBackend> {
    backend: Arc<B>,
}

impl<B: KernelBackend> ArtifactLoader<B> {
    pub fn new(backend: Arc<B>) -> ArtifactLoader<B> {
        ArtifactLoader { backend }
    }

    pub fn load(
        &self,
        artifact: &Artifact,
        expected: &EntryPoints,
    ) -> Result<InstrumentationBundle<B>, CaatError> {
        let loaded = self.backend.load(artifact)?;
        let id = loaded.id;

        let programs = loaded
            .programs
            .into_iter()
            .map(|p| {
                let handle = ProgramHandle {
                    bundle: id,
                    name: Arc::from(p.as_str()),
                };
                (p, handle)
            })
            .collect::<HashMap<_, _>>();
        let maps = loaded
            .maps
            .into_iter()
            .map(|m| {
                let handle = MapHandle {
                    bundle: id,
                    name: Arc::from(m.as_str()),
                };
                (m, handle)
            })
            .collect::<HashMap<_, _>>();

        let mut bundle = InstrumentationBundle {
            backend: self.backend.clone(),
            id,
            source: artifact.name(),
            programs,
            maps,
            attached: Arc::new(Mutex::new(HashSet::new())),
            released: false,
        };

        let missing: Vec<String> = expected
            .programs
            .iter()
            .filter(|p| !bundle.programs.contains_key(p.as_str()))
            .map(|p| format!("program {}", p))
            .chain(
                expected
                    .maps
                    .iter()
                    .filter(|m| !bundle.maps.contains_key(m.as_str()))
                    .map(|m| format!("map {}", m)),
            )
            .collect();

        if !missing.is_empty() {
            if let Err(e) = self.unload(&mut bundle) {
                error!(target: "error", "Could not unload incomplete {}: {}", id, e);
            }
            return Err(CaatError::InvalidArtifact(format!(
                "{} is missing {}",
                artifact.name(),
                missing.join(", ")
            )));
        }

        debug!(
            "{} provides {} program(s), {} map(s)",
            id,
            bundle.programs.len(),
            bundle.maps.len()
        );
        Ok(bundle)
    }

    /// Releases the bundle's kernel resources. A second call is a no-op;
    /// fails with `BundleInUse` while attachments are live.
    pub fn unload(&self, bundle: &mut InstrumentationBundle<B>) -> Result<(), CaatError> {
        bundle.release()
    }
}
