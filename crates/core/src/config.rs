use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
#[cfg(feature = "trace")]
use std::sync::atomic::AtomicBool;

use tracing::level_filters::LevelFilter;

use crate::bridge::LoopMode;

/// Default port of the WebSocket endpoint.
pub const DEFAULT_PORT: u16 = 8082;
/// Name of the data source seeded into the engine at startup.
pub const DEFAULT_DATA_SOURCE: &str = "data_source_one";

/// How the engine loop re-enters the engine.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopModeArg {
    /// Run every engine step on the loop itself.
    #[value(alias = "single")]
    Cooperative,
    /// Offload every engine step to a worker pool.
    #[default]
    Pool,
}

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "sessionmux", version, about = "Multiplexes client sessions onto a shared engine")]
pub struct ConfigArgs {
    /// Address the WebSocket endpoint binds to.
    #[clap(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST), env = "ADDRESS")]
    pub address: IpAddr,

    #[clap(long, default_value_t = DEFAULT_PORT, env = "PORT")]
    pub port: u16,

    #[clap(long, value_enum, default_value_t = LoopModeArg::Pool, env = "LOOP_MODE")]
    pub loop_mode: LoopModeArg,

    /// Worker threads in pool mode. Engine calls never overlap, so workers
    /// beyond the default of one stay idle.
    #[clap(long, env = "POOL_WORKERS")]
    pub pool_workers: Option<NonZeroUsize>,

    /// Data source hosted by the engine before traffic is accepted.
    #[clap(long, default_value = DEFAULT_DATA_SOURCE, env = "DATA_SOURCE")]
    pub data_source: String,

    #[clap(long, env = "LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

impl Default for ConfigArgs {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            loop_mode: LoopModeArg::default(),
            pool_workers: None,
            data_source: DEFAULT_DATA_SOURCE.to_owned(),
            log_level: None,
        }
    }
}

impl ConfigArgs {
    pub fn socket_addr(&self) -> SocketAddr {
        (self.address, self.port).into()
    }

    pub fn loop_mode(&self) -> LoopMode {
        match (self.loop_mode, self.pool_workers) {
            (LoopModeArg::Cooperative, _) => LoopMode::Cooperative,
            (LoopModeArg::Pool, Some(workers)) => LoopMode::Pool { workers },
            (LoopModeArg::Pool, None) => LoopMode::pool(),
        }
    }
}

/// Initializes logging once per process. Later calls are no-ops.
pub fn set_logger(level: Option<LevelFilter>) -> anyhow::Result<()> {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }

        crate::tracing::tracer::init_tracer(level)?;
    }
    #[cfg(not(feature = "trace"))]
    {
        let _ = level;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults() {
        let args = ConfigArgs::try_parse_from(["sessionmux"]).unwrap();
        assert_eq!(args.socket_addr(), "127.0.0.1:8082".parse().unwrap());
        assert_eq!(args.data_source, "data_source_one");
        assert_eq!(
            args.loop_mode(),
            LoopMode::Pool {
                workers: NonZeroUsize::MIN
            }
        );
    }

    #[test]
    fn cooperative_mode_from_flag() {
        let args = ConfigArgs::try_parse_from(["sessionmux", "--loop-mode", "single"]).unwrap();
        assert_eq!(args.loop_mode(), LoopMode::Cooperative);
    }

    #[test]
    fn explicit_pool_size() {
        let args = ConfigArgs::try_parse_from([
            "sessionmux",
            "--loop-mode",
            "pool",
            "--pool-workers",
            "3",
            "--log-level",
            "warn",
        ])
        .unwrap();
        assert_eq!(
            args.loop_mode(),
            LoopMode::Pool {
                workers: NonZeroUsize::new(3).unwrap()
            }
        );
        assert_eq!(args.log_level, Some(LevelFilter::WARN));
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(ConfigArgs::try_parse_from(["sessionmux", "--loop-mode", "threads"]).is_err());
    }
}
