use crate::kernel::BufferOptions;
use crate::stream::BackpressurePolicy;
use crate::supervisor::{HookConfig, SupervisorSettings};
use config::{Config, File, FileFormat};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CaatLogEntry {
    pub enable: bool,
    pub target: String,
    pub directory: Option<String>,
    pub prefix: Option<String>,
    pub rotation: Option<String>,
    pub max_files: Option<usize>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CaatLogsConfig {
    pub default: CaatLogEntry,
    pub errors: Option<CaatLogEntry>,
    pub events: Option<CaatLogEntry>,
    pub stats: Option<CaatLogEntry>,
}

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CaatFeatures {
    #[serde(default)]
    pub kernel_logs: bool,
    /// Run against the in-process kernel instead of loading into the host.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, serde_derive::Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaatLimits {
    pub channel_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub batch_size: usize,
    pub perf_pages: usize,
    pub shutdown_timeout_ms: u64,
    pub stats_interval_secs: u64,
}

impl Default for CaatLimits {
    fn default() -> Self {
        let buffer = BufferOptions::default();
        CaatLimits {
            channel_capacity: 1024,
            backpressure: BackpressurePolicy::DropNewest,
            batch_size: buffer.batch_size,
            perf_pages: buffer.perf_pages,
            shutdown_timeout_ms: 5000,
            stats_interval_secs: 60,
        }
    }
}

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CaatArtifact {
    pub path: PathBuf,
}

#[derive(Debug, Default, Clone, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CaatConfig {
    pub artifact: CaatArtifact,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub limits: CaatLimits,
    #[serde(default)]
    pub features: CaatFeatures,
    pub logs: CaatLogsConfig,
}

impl CaatConfig {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            hooks: self.hooks.clone(),
            streams: self.streams.clone(),
            policy: self.limits.backpressure,
            buffer: BufferOptions {
                batch_size: self.limits.batch_size.max(1),
                perf_pages: self.limits.perf_pages.max(1),
            },
            shutdown_timeout: Duration::from_millis(self.limits.shutdown_timeout_ms),
            stats_interval: match self.limits.stats_interval_secs {
                0 => None,
                s => Some(Duration::from_secs(s)),
            },
        }
    }
}

pub fn load_config() -> Result<CaatConfig, anyhow::Error> {
    let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "config/".into());
    let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());
    load_config_from(&config_dir, &run_mode)
}

pub fn load_config_from(dir: &str, run_mode: &str) -> Result<CaatConfig, anyhow::Error> {
    let mut config_dir = dir.to_string();
    if !config_dir.ends_with('/') {
        config_dir.push('/');
    }

    let config = Config::builder()
        .add_source(File::new(
            &format!("{}default.json5", config_dir),
            FileFormat::Json5,
        ))
        .add_source(
            File::new(&format!("{}{}.json5", config_dir, run_mode), FileFormat::Json5)
                .required(false),
        )
        .build()?;

    let conf: CaatConfig = config.try_deserialize()?;

    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::HookSpec;
    use std::fs;

    #[test]
    fn load_default_config() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/config");
        let conf = load_config_from(dir, "no-such-mode").unwrap();
        assert!(conf.logs.default.enable);
        assert_eq!(conf.streams, vec!["EVENTS".to_string()]);
        assert_eq!(conf.hooks[0].program, "trace_openat");
        assert_eq!(conf.limits.backpressure, BackpressurePolicy::DropNewest);
        assert!(!conf.features.dry_run);
    }

    #[test]
    fn run_mode_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.json5"),
            r#"{
                artifact: { path: "probes/caat.bpf.o" },
                hooks: [
                    { program: "trace_openat", hook: { type: "tracepoint", category: "syscalls", name: "sys_enter_openat" } },
                ],
                streams: ["EVENTS"],
                logs: { default: { enable: true, target: "stdout" } },
            }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("test.json5"),
            r#"{
                limits: { backpressure: "block", channel_capacity: 8, stats_interval_secs: 0 },
                features: { dry_run: true },
            }"#,
        )
        .unwrap();

        let conf = load_config_from(dir.path().to_str().unwrap(), "test").unwrap();
        assert!(conf.features.dry_run);
        assert_eq!(conf.limits.channel_capacity, 8);
        assert_eq!(
            conf.hooks[0].hook,
            HookSpec::Tracepoint {
                category: "syscalls".into(),
                name: "sys_enter_openat".into()
            }
        );

        let settings = conf.supervisor_settings();
        assert_eq!(settings.policy, BackpressurePolicy::Block);
        assert_eq!(settings.stats_interval, None);
        assert_eq!(settings.buffer.batch_size, BufferOptions::default().batch_size);
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn missing_default_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_from(dir.path().to_str().unwrap(), "dev").is_err());
    }
}
