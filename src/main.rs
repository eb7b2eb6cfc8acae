//! ImpactOS federation daemon.
//!
//! Headless entry point: init logging, then hand off to the library's `run`.
//! `RUST_LOG` overrides the default `info` filter.

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = impactos_federation_lib::run().await {
        log::error!("Federation node exited: {}", e);
        std::process::exit(1);
    }
}
