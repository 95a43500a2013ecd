//! The main entrypoint for efibootsync, which mostly just delegates to
//! its library.

use anyhow::Result;

fn run() -> Result<()> {
    efibootsync_utils::initialize_tracing();
    tracing::trace!("starting {}", efibootsync_utils::NAME);
    efibootsync_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    efibootsync_utils::run_main(run)
}
