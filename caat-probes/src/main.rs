use caat_probes::config::{self, CaatConfig};
use caat_probes::errors::CaatError;
use caat_probes::kernel::bpf::AyaBackend;
use caat_probes::kernel::sim::{SimBackend, SimTable};
use caat_probes::kernel::{Artifact, KernelBackend};
use caat_probes::logs::CaatLogs;
use caat_probes::sink;
use caat_probes::stream::decode::CaatDecoder;
use caat_probes::supervisor::{RunReport, Supervisor};
use std::sync::Arc;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = config::load_config()?;
    let _logs = CaatLogs::new(&config)?;

    // Bump the memlock rlimit. This is needed for older kernels that don't use the
    // new memcg based accounting, see https://lwn.net/Articles/837122/
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }

    let cancel = CancellationToken::new();
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(target: "error", "Cannot listen for Ctrl-C: {}", e);
                    }
                }
                _ = sigterm.recv() => {}
            }
            info!("Exiting...");
            cancel.cancel();
        }
    });

    let report = if config.features.dry_run {
        let table = SimTable {
            programs: config.hooks.iter().map(|h| h.program.clone()).collect(),
            maps: config.streams.clone(),
        };
        info!("Dry run, nothing is loaded into the kernel");
        run_agent(Arc::new(SimBackend::new().with_table(table)), &config, cancel).await
    } else {
        run_agent(Arc::new(AyaBackend::new(config.features.kernel_logs)), &config, cancel).await
    };

    match report {
        Ok(r) => {
            info!("Shutdown complete: {:?}", r);
            Ok(())
        }
        Err(e) => {
            error!(target: "error", "Agent failed: {}", e);
            Err(e.into())
        }
    }
}

async fn run_agent<B: KernelBackend>(
    backend: Arc<B>,
    config: &CaatConfig,
    cancel: CancellationToken,
) -> Result<RunReport, CaatError> {
    let supervisor = Supervisor::new(backend, config.supervisor_settings(), Arc::new(CaatDecoder));
    let (snd, recv) = mpsc::channel(config.limits.channel_capacity.max(1));
    let sink = tokio::spawn(sink::log_events(recv));

    info!("Waiting for Ctrl-C...");
    let artifact = Artifact::Path(config.artifact.path.clone());
    let report = supervisor.run(&artifact, snd, cancel).await;

    match sink.await {
        Ok(n) => debug!("Sink wrote {} event(s)", n),
        Err(e) => error!(target: "error", "Event sink task failed: {}", e),
    }
    report
}
