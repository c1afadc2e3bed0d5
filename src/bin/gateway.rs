/*
 * quorumkv-gateway is the client-facing ingress: rate limiting, then load
 * balancing across upstreams (usually just the coordinator), then
 * forwarding. Upstream responses are returned verbatim so quorum errors and
 * 429s reach the client unchanged.
 */

#![warn(clippy::all)]

use quorumkv::error::Result;
use quorumkv::gateway::limiter::LimiterConfig;
use quorumkv::gateway::{Gateway, GatewayConfig, UpstreamConfig};

use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("port")
                .long("port")
                .help("Listen port")
                .value_parser(clap::value_parser!(u16))
                .default_value("8000"),
        )
        .arg(clap::Arg::new("host").long("host").default_value("127.0.0.1"))
        .arg(
            clap::Arg::new("coordinator")
                .long("coordinator")
                .help("Coordinator URL, used when no explicit upstreams are given")
                .default_value("http://127.0.0.1:7000"),
        )
        .arg(
            clap::Arg::new("upstream")
                .long("upstream")
                .value_name("URL[*WEIGHT]")
                .help("Upstream node; repeat to front multiple nodes directly")
                .action(clap::ArgAction::Append),
        )
        .arg(
            clap::Arg::new("load-balance")
                .long("load-balance")
                .value_name("STRATEGY")
                .help("Load-balancing strategy: round-robin, adaptive or weighted")
                .default_value("round-robin"),
        )
        .arg(
            clap::Arg::new("rate-limit")
                .long("rate-limit")
                .help("Enable fixed-window rate limiting")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            clap::Arg::new("rate-limit-max")
                .long("rate-limit-max")
                .help("Max requests per client per window")
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
        .arg(clap::Arg::new("log-level").long("log-level").default_value("info"))
        .get_matches();

    let loglevel = args.get_one::<String>("log-level").unwrap().parse::<simplelog::LevelFilter>()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;
    exit_on_panic();

    let upstreams: Vec<UpstreamConfig> = match args.get_many::<String>("upstream") {
        Some(values) => values.map(|v| v.parse()).collect::<Result<_>>()?,
        None => vec![args.get_one::<String>("coordinator").unwrap().parse()?],
    };
    let rate_limit = args.get_flag("rate-limit").then(|| LimiterConfig {
        strategy: "fixed-window".into(),
        max_requests: *args.get_one::<usize>("rate-limit-max").unwrap(),
        window: Duration::from_secs(*args.get_one::<u64>("rate-limit-window").unwrap()),
    });
    let config = GatewayConfig {
        upstreams,
        strategy: args.get_one::<String>("load-balance").unwrap().clone(),
        rate_limit,
    };
    let host = args.get_one::<String>("host").unwrap().clone();
    let port = *args.get_one::<u16>("port").unwrap();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
        Gateway::new(config)?.serve(listener).await
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
