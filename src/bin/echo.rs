//! Echo server built on the riptide runtime.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use riptide::{Config, EventLoop, ServerOption, TcpServer, logging};

#[derive(Parser)]
#[command(name = "riptide-echo")]
#[command(about = "TCP echo server on the riptide multi-reactor runtime")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to load config: {}", err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(err) = run(config) {
        eprintln!("Server error: {}", err);
        std::process::exit(1);
    }
}

fn run(config: Config) -> std::io::Result<()> {
    let base_loop = EventLoop::new()?;

    {
        let base_loop = base_loop.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            base_loop.quit();
        })
        .expect("failed to install signal handler");
    }

    let option = if config.listener.reuse_port {
        ServerOption::ReusePort
    } else {
        ServerOption::NoReusePort
    };
    let server = TcpServer::new(&base_loop, config.listener.address, "echo", option)?;
    server.set_thread_num(config.threads());

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!(name = %conn.name(), peer = %conn.peer_addr(), "client up");
        } else {
            info!(name = %conn.name(), "client down");
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _ts| {
        let msg = buf.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    }));

    server.start();
    info!(
        address = %server.listen_addr()?,
        workers = config.threads(),
        "echo server running"
    );
    base_loop.run();
    Ok(())
}

fn print_default_config() {
    let config = r#"# riptide echo server configuration

[workers]
# Number of sub-loop threads (default: number of CPUs; 0 = single-threaded)
# threads = 4

[listener]
# Address to listen on
address = "0.0.0.0:7000"

# Bind with SO_REUSEPORT
reuse_port = false

[logging]
# Log level when RUST_LOG is not set: "trace", "debug", "info", "warn", "error"
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

# Include timestamps
timestamps = true

# Include thread names (names the owning loop)
thread_names = true
"#;
    print!("{}", config);
}
