mod allocate;
mod catalog;
mod claim;
mod config;
mod device;
mod diagnostics;
mod health;
mod node;
mod plugin;
mod store;
mod supervisor;

use clap::Parser;
use utils::version;

use crate::config::Cli;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init();

    tracing::info!("starting memslice device plugin {}", &**version::VERSION);

    if let Err(e) = supervisor::run(&cli).await {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}
