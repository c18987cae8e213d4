// Project Modules
use ln_jam_lib::{sim_roster, AttackOrchestrator, ExperimentConfig, NodeIndex, SimNetwork};

// External Modules
use anyhow::Context;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

// Standard Modules
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

// ==================================================================================================================
// Runs a jamming experiment against a simulated network described by JAM_NETWORK. The run goes until it finishes
// or the process gets SIGINT/SIGTERM, the JSON report is printed to stdout.
// ==================================================================================================================

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} {} -- {}",
                ln_jam_lib::get_current_time(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("ln_jam_runner: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ExperimentConfig::from_env()?;
    log::info!(
        "network {} with {} nodes, sequence {:?}",
        config.network_path.display(),
        config.network.nodes.len(),
        config.attack.sequence
    );

    let network = SimNetwork::new(&config.network).context("could not build the simulated network")?;
    let roster = Arc::new(sim_roster(&network, &config.roster)?);
    for index in NodeIndex::all() {
        let info = roster
            .node(index)
            .get_info()
            .await
            .with_context(|| format!("could not reach {}", index))?;
        log::info!("{} connected: {} ({})", index, info.alias, info.pubkey);
    }

    let (shutdown_trigger, shutdown) = triggered::trigger();
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("could not install signal handlers")?;
    let signals_handle = signals.handle();
    let signal_trigger = shutdown_trigger.clone();
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("received signal {}, stopping", signal);
            signal_trigger.trigger();
        }
    });

    let orchestrator = AttackOrchestrator::new(
        roster,
        network.clone(),
        config.attack.clone(),
        config.target,
        shutdown.clone(),
    )
    .await
    .context("attack setup failed")?;
    let orchestrator = Arc::new(orchestrator);

    // Teardown runs as soon as shutdown is requested, even while a phase is still waiting on the network
    let stopper = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            shutdown.await;
            orchestrator.stop().await;
        })
    };

    let result = orchestrator.run().await;
    shutdown_trigger.trigger();
    stopper.await.context("teardown task failed")?;
    signals_handle.close();

    let report = result.context("attack run failed")?;
    println!("{}", report.to_json()?);
    Ok(())
}
