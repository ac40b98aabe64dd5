use anyhow::Context;
use clap::Parser;
use cross_wg_sync::{Harness, ReduceMode, config::Cli};
use env_logger::Env;
use log::info;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level().as_str()))
        .init();

    let config = cli.into_config();
    let mut harness = Harness::new(config).context("failed to set up the harness")?;
    info!(
        "{} workgroups x {} threads on the {} backend",
        harness.config().groups,
        harness.config().block_size,
        harness.backend_name()
    );
    for mode in ReduceMode::ALL {
        let outcome = harness
            .run_mode(mode)
            .with_context(|| format!("{mode} did not complete"))?;
        // Validity is reported, not turned into an exit code.
        println!("{outcome}");
    }
    Ok(())
}
