use super::{
    Artifact, BufferOptions, BundleId, KernelBackend, LinkId, LoadedBundle, RawEventRecord,
    ReadStats, RecordSource,
};
use crate::errors::CaatError;
use crate::probes::{HookSpec, PerfCounter};
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::{Map, MapData, RingBuf};
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::perf_event::{
    perf_sw_ids, PerfEventLinkId, PerfEventScope, PerfTypeId, SamplePolicy,
};
use aya::programs::tp_btf::BtfTracePointLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::{
    BtfTracePoint, KProbe, PerfEvent, ProbeKind, Program, ProgramError, TracePoint,
};
use aya::util::online_cpus;
use aya::{Bpf, Btf};
use aya_log::BpfLogger;
use bytes::{Bytes, BytesMut};
use caat_probes_common::RECORD_SIZE;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};

// Kernel-internal errno some program types return for unsupported features.
const ENOTSUPP: i32 = 524;

// Scratch buffers kept per CPU for perf arrays.
const MAX_PERF_BATCH: usize = 512;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Load,
    Attach,
    Detach,
    Read,
}

/// Maps an aya error onto the agent's taxonomy by looking for the errno
/// underneath it. EPERM is a privilege problem; EACCES/EINVAL at load time
/// is the verifier rejecting the bytecode.
fn classify(err: &(dyn Error + 'static), phase: Phase, what: &str) -> CaatError {
    let msg = format!("{}: {}", what, err);

    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.raw_os_error() {
                Some(libc::EPERM) => return CaatError::PermissionDenied(msg),
                Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) | Some(ENOTSUPP) => {
                    return CaatError::KernelUnsupported(msg)
                }
                _ => break,
            }
        }
        source = e.source();
    }

    match phase {
        Phase::Load => CaatError::InvalidArtifact(msg),
        Phase::Attach | Phase::Detach | Phase::Read => CaatError::KernelIo(msg),
    }
}

/// The entry/return flavour of a kernel function program is fixed by its ELF section,
/// so the hook has to ask for the same one.
fn check_program_kind(hook: &HookSpec, kind: ProbeKind, program: &str) -> Result<(), CaatError> {
    let matches = match hook {
        HookSpec::Kprobe { .. } => matches!(kind, ProbeKind::KProbe),
        HookSpec::Kretprobe { .. } => matches!(kind, ProbeKind::KRetProbe),
        _ => true,
    };
    if matches {
        return Ok(());
    }
    Err(CaatError::InvalidAttribute {
        attribute: "Program kind does not match hook",
        value: format!("{} is {:?}, hook is {}", program, kind, hook),
    })
}

fn sw_config(counter: PerfCounter) -> u64 {
    match counter {
        PerfCounter::CpuClock => perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
        PerfCounter::TaskClock => perf_sw_ids::PERF_COUNT_SW_TASK_CLOCK as u64,
        PerfCounter::ContextSwitches => perf_sw_ids::PERF_COUNT_SW_CONTEXT_SWITCHES as u64,
    }
}

enum LinkIds {
    TracePoint(TracePointLinkId),
    KProbe(KProbeLinkId),
    BtfTracePoint(BtfTracePointLinkId),
    PerfEvent(Vec<PerfEventLinkId>),
}

struct AyaLink {
    program: String,
    ids: LinkIds,
}

struct LoadedBpf {
    bpf: Bpf,
    btf_loaded: HashSet<String>,
    links: HashMap<LinkId, AyaLink>,
}

pub struct AyaBackend {
    kernel_logs: bool,
    next_id: AtomicU64,
    bundles: Mutex<HashMap<BundleId, LoadedBpf>>,
}

impl AyaBackend {
    pub fn new(kernel_logs: bool) -> AyaBackend {
        AyaBackend {
            kernel_logs,
            next_id: AtomicU64::new(1),
            bundles: Mutex::new(HashMap::new()),
        }
    }

    fn attach_program(
        loaded: &mut LoadedBpf,
        name: &str,
        hook: &HookSpec,
    ) -> Result<LinkIds, CaatError> {
        let err = |e: ProgramError| classify(&e, Phase::Attach, name);

        let program = loaded
            .bpf
            .program_mut(name)
            .ok_or_else(|| CaatError::ProgramNotFound {
                program: name.to_string(),
            })?;

        let ids = match hook {
            HookSpec::Tracepoint { category, name: tp } => {
                let p: &mut TracePoint = program.try_into().map_err(err)?;
                LinkIds::TracePoint(p.attach(category, tp).map_err(err)?)
            }
            HookSpec::Kprobe { symbol, offset } => {
                let p: &mut KProbe = program.try_into().map_err(err)?;
                check_program_kind(hook, p.kind(), name)?;
                LinkIds::KProbe(p.attach(symbol.as_str(), *offset).map_err(err)?)
            }
            HookSpec::Kretprobe { symbol } => {
                let p: &mut KProbe = program.try_into().map_err(err)?;
                check_program_kind(hook, p.kind(), name)?;
                LinkIds::KProbe(p.attach(symbol.as_str(), 0).map_err(err)?)
            }
            HookSpec::BtfTracepoint { name: tp } => {
                let p: &mut BtfTracePoint = program.try_into().map_err(err)?;
                if !loaded.btf_loaded.contains(name) {
                    let btf = Btf::from_sys_fs().map_err(|e| {
                        CaatError::KernelUnsupported(format!("BTF (/sys/kernel/btf/vmlinux): {}", e))
                    })?;
                    p.load(tp, &btf).map_err(|e| classify(&e, Phase::Load, name))?;
                    loaded.btf_loaded.insert(name.to_string());
                }
                LinkIds::BtfTracePoint(p.attach().map_err(err)?)
            }
            HookSpec::PerfEvent {
                counter,
                frequency,
                cpu,
            } => {
                let p: &mut PerfEvent = program.try_into().map_err(err)?;
                let cpus = match cpu {
                    Some(c) => vec![*c],
                    None => online_cpus().map_err(|e| CaatError::KernelIo(e.to_string()))?,
                };

                let mut ids = Vec::with_capacity(cpus.len());
                for c in cpus {
                    match p.attach(
                        PerfTypeId::Software,
                        sw_config(*counter),
                        PerfEventScope::AllProcessesOneCpu { cpu: c },
                        SamplePolicy::Frequency(*frequency),
                        false,
                    ) {
                        Ok(id) => ids.push(id),
                        Err(e) => {
                            for id in ids {
                                if let Err(de) = p.detach(id) {
                                    warn!(target: "error", "Could not roll back perf event on {}: {}", name, de);
                                }
                            }
                            return Err(err(e));
                        }
                    }
                }
                LinkIds::PerfEvent(ids)
            }
        };

        Ok(ids)
    }

    fn detach_program(program: &mut Program, ids: LinkIds) -> Result<(), ProgramError> {
        match ids {
            LinkIds::TracePoint(id) => {
                let p: &mut TracePoint = program.try_into()?;
                p.detach(id)
            }
            LinkIds::KProbe(id) => {
                let p: &mut KProbe = program.try_into()?;
                p.detach(id)
            }
            LinkIds::BtfTracePoint(id) => {
                let p: &mut BtfTracePoint = program.try_into()?;
                p.detach(id)
            }
            LinkIds::PerfEvent(ids) => {
                let p: &mut PerfEvent = program.try_into()?;
                let mut first_err = None;
                for id in ids {
                    if let Err(e) = p.detach(id) {
                        first_err.get_or_insert(e);
                    }
                }
                first_err.map_or(Ok(()), Err)
            }
        }
    }
}

impl KernelBackend for AyaBackend {
    type Source = AyaSource;

    fn load(&self, artifact: &Artifact) -> Result<LoadedBundle, CaatError> {
        let name = artifact.name();
        let mut bpf = match artifact {
            Artifact::Path(path) => Bpf::load_file(path),
            Artifact::Bytes { data, .. } => Bpf::load(data),
        }
        .map_err(|e| classify(&e, Phase::Load, &name))?;

        // BTF tracepoints bind their attach target at load, so they wait for attach()
        for (prog_name, program) in bpf.programs_mut() {
            let res = match program {
                Program::TracePoint(p) => p.load(),
                Program::KProbe(p) => p.load(),
                Program::PerfEvent(p) => p.load(),
                _ => {
                    debug!("Deferring load of program {}", prog_name);
                    continue;
                }
            };
            res.map_err(|e| classify(&e, Phase::Load, prog_name))?;
        }

        if self.kernel_logs {
            if let Err(e) = BpfLogger::init(&mut bpf) {
                warn!("Failed to initialize eBPF logger: {}", e);
            }
        }

        let programs = bpf.programs().map(|(n, _)| n.to_string()).collect();
        let maps = bpf.maps().map(|(n, _)| n.to_string()).collect();
        let id = BundleId(self.next_id.fetch_add(1, Ordering::Relaxed));

        self.bundles.lock().insert(
            id,
            LoadedBpf {
                bpf,
                btf_loaded: HashSet::new(),
                links: HashMap::new(),
            },
        );
        info!("Loaded {} as {}", name, id);

        Ok(LoadedBundle { id, programs, maps })
    }

    fn unload(&self, bundle: BundleId) -> Result<(), CaatError> {
        // Dropping the Bpf object closes every program and map fd.
        if let Some(loaded) = self.bundles.lock().remove(&bundle) {
            if !loaded.links.is_empty() {
                warn!(target: "error", "Unloading {} with {} live link(s)", bundle, loaded.links.len());
            }
            debug!("Unloaded {}", bundle);
        }
        Ok(())
    }

    fn attach(
        &self,
        bundle: BundleId,
        program: &str,
        hook: &HookSpec,
    ) -> Result<LinkId, CaatError> {
        let mut bundles = self.bundles.lock();
        let loaded = bundles
            .get_mut(&bundle)
            .ok_or_else(|| CaatError::KernelIo(format!("{} is not loaded", bundle)))?;

        let ids = Self::attach_program(loaded, program, hook)?;
        let link = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        loaded.links.insert(
            link,
            AyaLink {
                program: program.to_string(),
                ids,
            },
        );
        Ok(link)
    }

    fn detach(&self, bundle: BundleId, link: LinkId) -> Result<(), CaatError> {
        let mut bundles = self.bundles.lock();
        let Some(loaded) = bundles.get_mut(&bundle) else {
            return Ok(());
        };
        let Some(aya_link) = loaded.links.remove(&link) else {
            return Ok(());
        };

        let program = loaded.bpf.program_mut(&aya_link.program).ok_or_else(|| {
            CaatError::ProgramNotFound {
                program: aya_link.program.clone(),
            }
        })?;

        Self::detach_program(program, aya_link.ids)
            .map_err(|e| classify(&e, Phase::Detach, &aya_link.program))
    }

    fn open_buffer(
        &self,
        bundle: BundleId,
        map: &str,
        opts: &BufferOptions,
    ) -> Result<AyaSource, CaatError> {
        let mut bundles = self.bundles.lock();
        let not_found = || CaatError::MapNotFound {
            map: map.to_string(),
        };
        let loaded = bundles.get_mut(&bundle).ok_or_else(not_found)?;
        let kernel_map = loaded.bpf.take_map(map).ok_or_else(not_found)?;

        if matches!(kernel_map, Map::RingBuf(_)) {
            let ring = RingBuf::try_from(kernel_map).map_err(|e| classify(&e, Phase::Read, map))?;
            let fd = AsyncFd::new(ring).map_err(|e| classify(&e, Phase::Read, map))?;
            return Ok(AyaSource::Ring {
                fd,
                batch_size: opts.batch_size.max(1),
            });
        }

        if matches!(kernel_map, Map::PerfEventArray(_)) {
            let mut array = AsyncPerfEventArray::try_from(kernel_map)
                .map_err(|e| classify(&e, Phase::Read, map))?;
            let scratch = opts.batch_size.clamp(1, MAX_PERF_BATCH);

            let mut cpus = Vec::new();
            for cpu in online_cpus().map_err(|e| CaatError::KernelIo(e.to_string()))? {
                let buf = array
                    .open(cpu, Some(opts.perf_pages))
                    .map_err(|e| classify(&e, Phase::Read, map))?;
                cpus.push(PerfCpu {
                    cpu,
                    buf,
                    scratch: vec![BytesMut::with_capacity(RECORD_SIZE); scratch],
                });
            }
            return Ok(AyaSource::Perf(cpus));
        }

        Err(CaatError::InvalidArtifact(format!(
            "map {} is neither a ring buffer nor a perf event array",
            map
        )))
    }
}

pub struct PerfCpu {
    cpu: u32,
    buf: AsyncPerfEventArrayBuffer<MapData>,
    scratch: Vec<BytesMut>,
}

pub enum AyaSource {
    Ring {
        fd: AsyncFd<RingBuf<MapData>>,
        batch_size: usize,
    },
    Perf(Vec<PerfCpu>),
}

impl RecordSource for AyaSource {
    async fn read_batch(&mut self, out: &mut Vec<RawEventRecord>) -> Result<ReadStats, CaatError> {
        match self {
            AyaSource::Ring { fd, batch_size } => read_ring(fd, *batch_size, out).await,
            AyaSource::Perf(cpus) => read_perf(cpus, out).await,
        }
    }
}

async fn read_ring(
    fd: &mut AsyncFd<RingBuf<MapData>>,
    batch_size: usize,
    out: &mut Vec<RawEventRecord>,
) -> Result<ReadStats, CaatError> {
    loop {
        let mut guard = fd
            .readable_mut()
            .await
            .map_err(|e| CaatError::KernelIo(format!("ring buffer poll: {}", e)))?;

        let ring = guard.get_inner_mut();
        let mut read = 0;
        while read < batch_size {
            match ring.next() {
                Some(item) => {
                    out.push(RawEventRecord {
                        cpu: None,
                        data: Bytes::copy_from_slice(&item),
                    });
                    read += 1;
                }
                None => break,
            }
        }

        // keep the readiness flag when the batch filled up before the ring drained
        if read < batch_size {
            guard.clear_ready();
        }
        if read > 0 {
            return Ok(ReadStats::default());
        }
    }
}

/// Waits on every CPU buffer and drains the first one that has data. Per-CPU
/// order is kept; the interleaving across CPUs is arrival order.
///
/// `select_all` favours the front of the list, so the served CPU is moved to
/// the back and a busy CPU cannot starve the others.
async fn read_perf(
    cpus: &mut [PerfCpu],
    out: &mut Vec<RawEventRecord>,
) -> Result<ReadStats, CaatError> {
    if cpus.is_empty() {
        return Err(CaatError::KernelIo("no online CPUs".to_string()));
    }

    let reads = cpus
        .iter_mut()
        .map(|c| Box::pin(c.buf.read_events(&mut c.scratch)));
    let (res, served, pending) = futures::future::select_all(reads).await;
    drop(pending);

    let res = res.map_err(|e| classify(&e, Phase::Read, "perf buffer"));
    if let Ok(events) = &res {
        let cpu = &cpus[served];
        for buf in cpu.scratch.iter().take(events.read) {
            out.push(RawEventRecord {
                cpu: Some(cpu.cpu),
                data: Bytes::copy_from_slice(buf),
            });
        }
    }
    requeue(cpus, served);

    Ok(ReadStats {
        lost: res?.lost as u64,
    })
}

/// Moves the slot at `served` to the back, keeping the others in order.
fn requeue<T>(slots: &mut [T], served: usize) {
    if served < slots.len() {
        slots[served..].rotate_left(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "map create failed")
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn classify_eperm_is_permission() {
        let err = Wrapped(io::Error::from_raw_os_error(libc::EPERM));
        assert!(matches!(
            classify(&err, Phase::Load, "EVENTS"),
            CaatError::PermissionDenied(_)
        ));
    }

    #[test]
    fn classify_verifier_rejection_is_invalid_artifact() {
        let err = Wrapped(io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(
            classify(&err, Phase::Load, "trace_openat"),
            CaatError::InvalidArtifact(_)
        ));
        assert!(matches!(
            classify(&err, Phase::Attach, "trace_openat"),
            CaatError::KernelIo(_)
        ));
    }

    #[test]
    fn classify_unsupported() {
        let err = Wrapped(io::Error::from_raw_os_error(ENOTSUPP));
        assert!(matches!(
            classify(&err, Phase::Attach, "trace_sched"),
            CaatError::KernelUnsupported(_)
        ));
    }

    #[test]
    fn entry_and_return_hooks_need_matching_programs() {
        let entry = HookSpec::Kprobe {
            symbol: "tcp_connect".into(),
            offset: 0,
        };
        let ret = HookSpec::Kretprobe {
            symbol: "tcp_connect".into(),
        };
        assert!(check_program_kind(&entry, ProbeKind::KProbe, "trace_connect").is_ok());
        assert!(check_program_kind(&ret, ProbeKind::KRetProbe, "trace_connect").is_ok());

        let err = check_program_kind(&ret, ProbeKind::KProbe, "trace_connect").unwrap_err();
        assert!(matches!(
            err,
            CaatError::InvalidAttribute { ref value, .. } if value.contains("trace_connect")
        ));
        assert!(check_program_kind(&entry, ProbeKind::KRetProbe, "trace_connect").is_err());
    }

    #[test]
    fn served_cpu_goes_to_the_back() {
        // select_all always picks the first ready slot, so with every buffer
        // busy the front slot is the one served.
        let mut cpus = vec![0, 1, 2];
        let mut served = Vec::new();
        for _ in 0..6 {
            served.push(cpus[0]);
            requeue(&mut cpus, 0);
        }
        assert_eq!(served, vec![0, 1, 2, 0, 1, 2]);

        let mut cpus = vec![0, 1, 2, 3];
        requeue(&mut cpus, 1);
        assert_eq!(cpus, vec![0, 2, 3, 1]);
        requeue(&mut cpus, 7);
        assert_eq!(cpus, vec![0, 2, 3, 1]);
    }
}
