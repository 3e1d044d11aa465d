#[cfg(feature = "trace")]
pub(crate) mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{Layer, Registry};

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` directives take precedence over `level`. Output is pretty
    /// printed unless `SESSIONMUX_LOG_FORMAT=json`.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let default_filter = level.unwrap_or(default_filter);
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_filter.into())
            .from_env_lossy()
            .add_directive("hyper=info".parse()?)
            .add_directive("tower_http=info".parse()?);

        use tracing_subscriber::layer::SubscriberExt;

        if std::env::var("SESSIONMUX_DISABLE_LOGS").is_ok() {
            return Ok(());
        }
        let to_stderr = std::env::var("SESSIONMUX_LOG_TO_STDERR").is_ok();
        let json = std::env::var("SESSIONMUX_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_thread_names(true);
            if to_stderr {
                fmt_layer.with_writer(std::io::stderr).boxed()
            } else {
                fmt_layer.boxed()
            }
        } else {
            let fmt_layer = tracing_subscriber::fmt::layer().with_level(true).pretty();
            let fmt_layer = if cfg!(any(test, debug_assertions)) {
                fmt_layer.with_file(true).with_line_number(true)
            } else {
                fmt_layer
            };
            if to_stderr {
                fmt_layer.with_writer(std::io::stderr).boxed()
            } else {
                fmt_layer.boxed()
            }
        };

        let subscriber = Registry::default().with(layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}
