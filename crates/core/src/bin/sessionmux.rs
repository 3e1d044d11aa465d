use clap::Parser;
use sessionmux::{
    config::{set_logger, ConfigArgs},
    server, LoopBridge, MemoryEngine, SessionRegistry,
};

type DynError = sessionmux::DynError;

const SEED_ROWS: &[u8] = b"x,y,label\n1,2.5,a\n2,3.1,b\n3,1.7,c\n";

async fn run(config: ConfigArgs) -> Result<(), DynError> {
    let registry = SessionRegistry::new();
    let mut engine = MemoryEngine::new();
    engine.host_data_source(config.data_source.clone(), SEED_ROWS);

    let mode = config.loop_mode();
    let bridge = LoopBridge::new(engine, registry)
        .with_mode(mode)
        .spawn_dedicated()?;
    tracing::info!(?mode, addr = %config.socket_addr(), "starting sessionmux");

    let res = tokio::select! {
        res = server::serve(&config, bridge.handle()) => res.map_err(DynError::from),
        res = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            res.map_err(DynError::from)
        }
    };
    bridge.join()?;
    res
}

fn main() -> Result<(), DynError> {
    let config = ConfigArgs::parse();
    set_logger(config.log_level)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}
