use crate::errors::CaatError;
use crate::kernel::{BundleId, KernelBackend, LinkId};
use crate::loader::{AttachmentSlot, InstrumentationBundle, ProgramHandle};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_derive::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfCounter {
    CpuClock,
    TaskClock,
    ContextSwitches,
}

/// Kernel hook a program is bound to.
#[derive(Debug, Clone, PartialEq, Eq, serde_derive::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookSpec {
    Tracepoint {
        category: String,
        name: String,
    },
    BtfTracepoint {
        name: String,
    },
    Kprobe {
        symbol: String,
        #[serde(default)]
        offset: u64,
    },
    Kretprobe {
        symbol: String,
    },
    PerfEvent {
        counter: PerfCounter,
        frequency: u64,
        /// Restrict sampling to one CPU; all online CPUs otherwise.
        #[serde(default)]
        cpu: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Tracepoint,
    BtfTracepoint,
    Kprobe,
    Kretprobe,
    PerfEvent,
}

impl HookSpec {
    pub fn kind(&self) -> HookKind {
        match self {
            HookSpec::Tracepoint { .. } => HookKind::Tracepoint,
            HookSpec::BtfTracepoint { .. } => HookKind::BtfTracepoint,
            HookSpec::Kprobe { .. } => HookKind::Kprobe,
            HookSpec::Kretprobe { .. } => HookKind::Kretprobe,
            HookSpec::PerfEvent { .. } => HookKind::PerfEvent,
        }
    }

    /// Symbolic name of the hook point, e.g. `syscalls/sys_enter_openat`.
    pub fn target(&self) -> String {
        match self {
            HookSpec::Tracepoint { category, name } => format!("{}/{}", category, name),
            HookSpec::BtfTracepoint { name } => format!("btf/{}", name),
            HookSpec::Kprobe { symbol, offset: 0 } => format!("kprobe/{}", symbol),
            HookSpec::Kprobe { symbol, offset } => format!("kprobe/{}+{:#x}", symbol, offset),
            HookSpec::Kretprobe { symbol } => format!("kretprobe/{}", symbol),
            HookSpec::PerfEvent {
                counter,
                frequency,
                cpu,
            } => match cpu {
                Some(c) => format!("perf/{:?}@{}hz/cpu{}", counter, frequency, c),
                None => format!("perf/{:?}@{}hz", counter, frequency),
            },
        }
    }
}

impl fmt::Display for HookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target())
    }
}

/// One live hook. Closing is idempotent; an open handle closes itself on drop.
pub struct AttachmentHandle<B: KernelBackend> {
    backend: Arc<B>,
    program: ProgramHandle,
    hook: HookSpec,
    link: LinkId,
    created: DateTime<Utc>,
    slot: Option<AttachmentSlot>,
}

impl<B: KernelBackend> AttachmentHandle<B> {
    pub fn kind(&self) -> HookKind {
        self.hook.kind()
    }

    pub fn target(&self) -> String {
        self.hook.target()
    }

    pub fn program(&self) -> &ProgramHandle {
        &self.program
    }

    pub fn bundle(&self) -> BundleId {
        self.program.bundle()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn is_live(&self) -> bool {
        self.slot.is_some()
    }

    /// Removes the hook. The program is released from the bundle even when
    /// the kernel refuses, so unloading the bundle can still reclaim it.
    pub fn close(&mut self) -> Result<(), CaatError> {
        let Some(slot) = self.slot.take() else {
            return Ok(());
        };

        let res = self.backend.detach(self.program.bundle(), self.link);
        drop(slot);

        match res {
            Ok(()) => {
                debug!("Detached {} from {}", self.program.name(), self.hook);
                Ok(())
            }
            Err(e) => {
                error!(target: "error", "Detach of {} from {} failed, kernel link may leak: {}", self.program.name(), self.hook, e);
                Err(e)
            }
        }
    }
}

impl<B: KernelBackend> Drop for AttachmentHandle<B> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            warn!(target: "error", "Attachment {} -> {} dropped while live, detaching", self.program.name(), self.hook);
            let _ = self.close();
        }
    }
}

impl<B: KernelBackend> fmt::Debug for AttachmentHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentHandle")
            .field("program", &self.program.name())
            .field("hook", &self.hook)
            .field("created", &self.created)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Binds loaded programs to kernel hooks. Callers serialize attach/detach
/// against one bundle; the manager does not order teardown itself.
pub struct AttachmentManager<B: KernelBackend> {
    backend: Arc<B>,
}

impl<B: KernelBackend> AttachmentManager<B> {
    pub fn new(backend: Arc<B>) -> AttachmentManager<B> {
        AttachmentManager { backend }
    }

    pub fn attach(
        &self,
        bundle: &InstrumentationBundle<B>,
        program: &str,
        hook: &HookSpec,
    ) -> Result<AttachmentHandle<B>, CaatError> {
        let handle = bundle
            .program(program)
            .cloned()
            .ok_or_else(|| CaatError::ProgramNotFound {
                program: program.to_string(),
            })?;

        // released again on error when the slot drops
        let slot = bundle.reserve(program)?;
        let link = self.backend.attach(bundle.id(), program, hook)?;

        info!("Attached {} to {}", program, hook);
        Ok(AttachmentHandle {
            backend: self.backend.clone(),
            program: handle,
            hook: hook.clone(),
            link,
            created: Utc::now(),
            slot: Some(slot),
        })
    }

    pub fn detach(&self, handle: &mut AttachmentHandle<B>) -> Result<(), CaatError> {
        handle.close()
    }
}
