/*
 * quorumkv-node runs a single key/value node. Leaders accept client writes
 * and replicate them to the follower lists the coordinator hands them;
 * followers accept replicated writes after their configured delay. Normally
 * spawned by quorumkv-coordinator, but can be run standalone.
 */

#![warn(clippy::all)]

use quorumkv::api::Role;
use quorumkv::error::Result;
use quorumkv::gateway::limiter::LimiterConfig;
use quorumkv::node::{Node, NodeConfig};

use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(clap::Arg::new("id").long("id").help("Node id").default_value("node-1"))
        .arg(
            clap::Arg::new("port")
                .long("port")
                .help("Listen port")
                .value_parser(clap::value_parser!(u16))
                .default_value("7001"),
        )
        .arg(
            clap::Arg::new("role")
                .long("role")
                .help("Replication role: leader or follower")
                .default_value("follower"),
        )
        .arg(
            clap::Arg::new("host")
                .long("host")
                .help("Host advertised to the registry")
                .default_value("127.0.0.1"),
        )
        .arg(clap::Arg::new("registry").long("registry").help("Registry URL for heartbeats"))
        .arg(
            clap::Arg::new("replication-delay")
                .long("replication-delay")
                .help("Seconds to delay each replicated write")
                .value_parser(clap::value_parser!(f64))
                .default_value("0"),
        )
        .arg(
            clap::Arg::new("load-factor")
                .long("load-factor")
                .help("Synthetic CPU cost per request (recursive Fibonacci depth)")
                .value_parser(clap::value_parser!(u32))
                .default_value("0"),
        )
        .arg(
            clap::Arg::new("workers")
                .long("workers")
                .help("Worker threads (defaults to the number of cores)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            clap::Arg::new("rate-limit")
                .long("rate-limit")
                .value_name("STRATEGY")
                .help("Enable request rate limiting with the given strategy"),
        )
        .arg(
            clap::Arg::new("rate-limit-max")
                .long("rate-limit-max")
                .help("Max requests per window")
                .value_parser(clap::value_parser!(usize))
                .default_value("10"),
        )
        .arg(
            clap::Arg::new("rate-limit-window")
                .long("rate-limit-window")
                .help("Rate limit window in seconds")
                .value_parser(clap::value_parser!(u64))
                .default_value("60"),
        )
        .arg(
            clap::Arg::new("startup-epoch")
                .long("startup-epoch")
                .help("Respawn generation, set by the coordinator")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(clap::Arg::new("log-level").long("log-level").default_value("info"))
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;
    exit_on_panic();

    let role: Role = args.get_one::<String>("role").unwrap().parse()?;
    let host = args.get_one::<String>("host").unwrap().clone();
    let port = *args.get_one::<u16>("port").unwrap();

    let mut config = NodeConfig::new(args.get_one::<String>("id").unwrap().clone(), role, port);
    config.host = host.clone();
    config.registry = args.get_one::<String>("registry").cloned();
    config.replication_delay =
        Duration::from_secs_f64(*args.get_one::<f64>("replication-delay").unwrap());
    config.load_factor = *args.get_one::<u32>("load-factor").unwrap();
    config.startup_epoch = *args.get_one::<u64>("startup-epoch").unwrap();
    config.rate_limit = args.get_one::<String>("rate-limit").map(|strategy| LimiterConfig {
        strategy: strategy.clone(),
        max_requests: *args.get_one::<usize>("rate-limit-max").unwrap(),
        window: Duration::from_secs(*args.get_one::<u64>("rate-limit-window").unwrap()),
    });

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = args.get_one::<usize>("workers") {
        builder.worker_threads(*workers);
    }
    let runtime = builder.build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        Node::new(config)?.serve(listener).await
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
