use crate::config::{CaatConfig, CaatLogEntry};
use crate::errors::CaatError;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt::{format, layer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, EnvFilter, Layer};

macro_rules! parse_filter {
    ($layers:expr, $layer:expr, $filter:expr) => {{
        if let Some(f) = $filter {
            $layers.push($layer.with_filter(f).boxed());
        } else {
            $layers.push($layer.boxed());
        }
    }};
}

macro_rules! parse_layer {
    ($layers:expr, $writer:expr, $format:expr, $filter:expr) => {{
        let s_format = match $format {
            Some(f) => f.as_str(),
            None => "full",
        };

        match s_format.trim().to_ascii_lowercase().as_str() {
            "compact" => {
                let layer = layer()
                    .with_writer($writer)
                    .event_format(format().with_target(true).with_level(true).compact());
                parse_filter!($layers, layer, $filter);
            }
            "pretty" => {
                let layer = layer()
                    .with_writer($writer)
                    .event_format(format().with_target(true).with_level(true).pretty());
                parse_filter!($layers, layer, $filter);
            }
            "json" => {
                let layer = layer().with_writer($writer).event_format(
                    format()
                        .with_target(true)
                        .with_level(true)
                        .json()
                        .flatten_event(true),
                );
                parse_filter!($layers, layer, $filter);
            }
            _ => {
                let layer = layer()
                    .with_writer($writer)
                    .event_format(format().with_target(true).with_level(true));
                parse_filter!($layers, layer, $filter);
            }
        }
    }};
}

/// Log targets that get their own channel when configured.
const CHANNELS: [&str; 3] = ["error", "event", "stats"];

pub struct CaatLogs {
    _guards: Vec<WorkerGuard>,
}

impl CaatLogs {
    fn parse_log_entry(entry: &CaatLogEntry) -> Result<(NonBlocking, WorkerGuard), anyhow::Error> {
        match entry.target.as_str() {
            "stderr" => Ok(tracing_appender::non_blocking(std::io::stderr())),
            "stdout" => Ok(tracing_appender::non_blocking(std::io::stdout())),
            "file" => {
                let directory = match &entry.directory {
                    Some(d) => d.as_str(),
                    None => return Err(CaatError::MissingAttribute("directory".to_string()).into()),
                };

                let prefix = match &entry.prefix {
                    Some(p) => p.as_str(),
                    None => return Err(CaatError::MissingAttribute("prefix".to_string()).into()),
                };

                let s_rotation = entry.rotation.as_deref().unwrap_or("daily");
                let rotation = match s_rotation.trim().to_ascii_lowercase().as_str() {
                    "hourly" => rolling::Rotation::HOURLY,
                    "daily" => rolling::Rotation::DAILY,
                    "never" => rolling::Rotation::NEVER,
                    _ => {
                        return Err(CaatError::InvalidAttribute {
                            attribute: "Invalid log rotation",
                            value: s_rotation.to_string(),
                        }
                        .into());
                    }
                };

                let appender = rolling::RollingFileAppender::builder()
                    .rotation(rotation)
                    .filename_prefix(prefix)
                    .max_log_files(entry.max_files.unwrap_or(5))
                    .build(directory)?;

                Ok(tracing_appender::non_blocking(appender))
            }
            _ => Err(CaatError::InvalidAttribute {
                attribute: "Invalid log target",
                value: entry.target.to_string(),
            }
            .into()),
        }
    }

    pub fn new(config: &CaatConfig) -> Result<CaatLogs, anyhow::Error> {
        let logs_conf = &config.logs;

        let mut layers = Vec::new();
        let mut guards = Vec::new();

        let channels = [&logs_conf.errors, &logs_conf.events, &logs_conf.stats];

        if logs_conf.default.enable {
            let (w, guard) = CaatLogs::parse_log_entry(&logs_conf.default)?;
            guards.push(guard);

            // targets with their own channel stay out of the default one
            let routed: Vec<&'static str> = CHANNELS
                .iter()
                .zip(channels.iter())
                .filter(|(_, e)| e.is_some())
                .map(|(t, _)| *t)
                .collect();

            let f = filter::filter_fn(move |metadata| !routed.contains(&metadata.target()));
            parse_layer!(layers, w, &logs_conf.default.format, Some(f));
        }

        for (target, entry) in CHANNELS.iter().zip(channels.iter()) {
            let Some(e) = entry else {
                continue;
            };
            if !e.enable {
                continue;
            }
            let (w, guard) = CaatLogs::parse_log_entry(e)?;
            guards.push(guard);

            let target: &'static str = *target;
            let f = filter::filter_fn(move |metadata| metadata.target() == target);
            parse_layer!(layers, w, &e.format, Some(f));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(EnvFilter::from_default_env())
            .init();

        Ok(CaatLogs { _guards: guards })
    }
}
