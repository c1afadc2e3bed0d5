/*
 * quorumkv-coordinator boots and fronts the cluster: it spawns the leader
 * and follower node processes, owns the quorum parameters, and serves the
 * client write/read API plus spawn/kill cluster management.
 */

#![warn(clippy::all)]

use quorumkv::coordinator::{Coordinator, CoordinatorConfig};
use quorumkv::error::Result;

use std::path::PathBuf;
use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("port")
                .long("port")
                .help("Listen port; node ports are allocated above it")
                .value_parser(clap::value_parser!(u16))
                .default_value("7000"),
        )
        .arg(clap::Arg::new("host").long("host").default_value("127.0.0.1"))
        .arg(
            clap::Arg::new("followers")
                .long("followers")
                .help("Number of followers to boot")
                .value_parser(clap::value_parser!(usize))
                .default_value("2"),
        )
        .arg(
            clap::Arg::new("write-quorum")
                .long("write-quorum")
                .short('W')
                .help("Sync follower acks required per write")
                .value_parser(clap::value_parser!(usize))
                .default_value("2"),
        )
        .arg(
            clap::Arg::new("read-quorum")
                .long("read-quorum")
                .short('R')
                .help("Followers queried per read")
                .value_parser(clap::value_parser!(usize))
                .default_value("1"),
        )
        .arg(
            clap::Arg::new("registry")
                .long("registry")
                .help("Registry URL passed to spawned nodes")
                .default_value("http://127.0.0.1:9000"),
        )
        .arg(
            clap::Arg::new("node-bin")
                .long("node-bin")
                .help("Path to the node binary (defaults to a sibling of this executable)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            clap::Arg::new("sync-delay")
                .long("sync-delay")
                .help("Replication delay in seconds for sync-set followers")
                .value_parser(clap::value_parser!(f64))
                .default_value("0.5"),
        )
        .arg(
            clap::Arg::new("async-delay")
                .long("async-delay")
                .help("Replication delay in seconds for async followers")
                .value_parser(clap::value_parser!(f64))
                .default_value("5"),
        )
        .arg(
            clap::Arg::new("read-retry")
                .long("read-retry")
                .help("Retry reads against spare followers outside the read set")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(clap::Arg::new("log-level").long("log-level").default_value("info"))
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;
    exit_on_panic();

    let host = args.get_one::<String>("host").unwrap().clone();
    let port = *args.get_one::<u16>("port").unwrap();
    let config = CoordinatorConfig {
        registry: args.get_one::<String>("registry").cloned(),
        followers: *args.get_one::<usize>("followers").unwrap(),
        write_quorum: *args.get_one::<usize>("write-quorum").unwrap(),
        read_quorum: *args.get_one::<usize>("read-quorum").unwrap(),
        host: host.clone(),
        node_base_port: port,
        node_bin: args.get_one::<PathBuf>("node-bin").cloned(),
        sync_delay: Duration::from_secs_f64(*args.get_one::<f64>("sync-delay").unwrap()),
        async_delay: Duration::from_secs_f64(*args.get_one::<f64>("async-delay").unwrap()),
        read_retry: args.get_flag("read-retry"),
        ..CoordinatorConfig::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        // Bind before booting the cluster so a taken port fails fast.
        let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        let coordinator = Coordinator::new(config);
        coordinator.bootstrap().await?;
        coordinator.serve(listener).await
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
