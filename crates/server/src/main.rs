mod config;
mod events;
mod server;
mod tcp;
mod udp;

use anyhow::Result;
use clap::Parser;

use netplay::ScrambleSecrets;

use config::ServerConfig;
use server::ServerContext;

#[derive(Parser)]
#[command(name = "netplay-server")]
#[command(about = "Session server for the netplay protocol")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = netplay::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = netplay::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = netplay::DEFAULT_SESSION_SIZE)]
    session_size: u16,

    #[arg(long, help = "Log at debug level instead of info")]
    verbose: bool,

    #[arg(long, default_value_t = 1, help = "First handshake scramble secret")]
    secret_one: u64,

    #[arg(long, default_value_t = 2, help = "Second handshake scramble secret")]
    secret_two: u64,

    #[arg(long, default_value_t = 3, help = "Third handshake scramble secret")]
    secret_three: u64,

    #[arg(long, default_value_t = 4, help = "Fourth handshake scramble secret")]
    secret_four: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let config = ServerConfig {
        session_size: args.session_size,
        tick_rate: args.tick_rate,
        scramble_secrets: ScrambleSecrets {
            one: args.secret_one,
            two: args.secret_two,
            three: args.secret_three,
            four: args.secret_four,
        },
        ..Default::default()
    };

    let mut server = ServerContext::new(&bind_addr, config)?;
    log::info!(
        "server started, tcp on {} / udp on {}",
        server.tcp_addr(),
        server.udp_addr()
    );
    server.run();
    log::info!("server shutting down");

    Ok(())
}
