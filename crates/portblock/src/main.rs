//! Holds a loopback TCP port open, to exercise bind-in-use failures in a
//! running tunnel engine.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::time;

/// Bind a local TCP port and hold it until killed.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port to occupy on 127.0.0.1.
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    println!("[portblock] starting on port {}", args.port);

    loop {
        match TcpListener::bind(("127.0.0.1", args.port)).await {
            Ok(listener) => {
                println!("[portblock] holding 127.0.0.1:{}", args.port);
                // Accepted connections are dropped immediately; the point is
                // to keep the port bound.
                while listener.accept().await.is_ok() {}
            }
            Err(_) => time::sleep(Duration::from_secs(1)).await,
        }
    }
}
