#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use clap::Parser;
use honeysap::cli::CommonArgs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CommonArgs::parse();
    init_logging(&args)?;

    let config = Arc::new(honeysap::config::load(&args.config)?);

    if config.services.iter().all(|s| !s.enabled) {
        log::warn!("no services enabled, nothing to do");
        return Ok(());
    }

    honeysap::run_honeypot(config).await
}

fn init_logging(args: &CommonArgs) -> anyhow::Result<()> {
    let level = args.log_level().to_level_filter();
    let floor = if args.show_all_logs { level } else { log::LevelFilter::Warn };

    simple_logger::SimpleLogger::new()
        .with_colors(args.colored_console)
        .with_level(floor)
        .with_module_level(env!("CARGO_PKG_NAME"), level)
        .init()?;
    Ok(())
}
