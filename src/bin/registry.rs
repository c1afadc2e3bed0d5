/*
 * quorumkv-registry runs the membership registry: it receives node
 * heartbeats, prunes nodes that go silent, and optionally asks the
 * coordinator to respawn pruned followers after a cool-down.
 */

#![warn(clippy::all)]

use quorumkv::error::Result;
use quorumkv::registry::{Registry, RegistryConfig};

use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("port")
                .long("port")
                .help("Listen port")
                .value_parser(clap::value_parser!(u16))
                .default_value("9000"),
        )
        .arg(clap::Arg::new("host").long("host").default_value("127.0.0.1"))
        .arg(
            clap::Arg::new("coordinator")
                .long("coordinator")
                .help("Coordinator URL for catch-up hints and respawns")
                .default_value("http://127.0.0.1:7000"),
        )
        .arg(
            clap::Arg::new("auto-spawn")
                .long("auto-spawn")
                .help("Respawn pruned followers after the spawn delay")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new("spawn-delay")
                .long("spawn-delay")
                .help("Seconds between pruning a follower and requesting its respawn")
                .value_parser(clap::value_parser!(f64))
                .default_value("10"),
        )
        .arg(
            clap::Arg::new("prune-threshold")
                .long("prune-threshold")
                .help("Seconds of heartbeat silence before a node is pruned")
                .value_parser(clap::value_parser!(f64))
                .default_value("5"),
        )
        .arg(clap::Arg::new("log-level").long("log-level").default_value("info"))
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;
    exit_on_panic();

    let config = RegistryConfig {
        coordinator: args.get_one::<String>("coordinator").cloned(),
        prune_threshold: Duration::from_secs_f64(*args.get_one::<f64>("prune-threshold").unwrap()),
        auto_spawn: args.get_flag("auto-spawn"),
        spawn_delay: Duration::from_secs_f64(*args.get_one::<f64>("spawn-delay").unwrap()),
        ..RegistryConfig::default()
    };
    let host = args.get_one::<String>("host").unwrap().clone();
    let port = *args.get_one::<u16>("port").unwrap();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        Registry::new(config).serve(listener).await
    })
}

/// Exit with code 2 on a runtime panic, after the default hook has printed
/// the panic message.
fn exit_on_panic() {
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        hook(info);
        std::process::exit(2);
    }));
}
