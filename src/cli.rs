use clap::Parser;

/// Flags shared by both binaries: `honeysap` (service mode) and
/// `honeysapeater` (collector mode).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: std::path::PathBuf,

    /// Verbosity, repeatable 0-3: error, warning, info, debug.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Colorize console log output.
    #[arg(long)]
    pub colored_console: bool,

    /// Show logs from every module, not just this crate's namespace.
    #[arg(long)]
    pub show_all_logs: bool,
}

impl CommonArgs {
    pub fn log_level(&self) -> log::Level {
        match self.verbose {
            0 => log::Level::Error,
            1 => log::Level::Warn,
            2 => log::Level::Info,
            _ => log::Level::Debug,
        }
    }
}
