//! Echo demo: write a message through a stream over the loopback transport
//! and read it back.

use std::str::FromStr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use strata::{Error, Stream, StreamEvents};
use strata_demos::LoopbackTransport;
use strata_rt::ThreadPlatform;

#[derive(Parser)]
#[command(name = "Echo")]
#[command(version = "0.1.0")]
#[command(about = "An echo demo over the loopback transport", long_about = None)]
struct Cli {
    #[arg(short, long, default_value_t = format!("hello strata"))]
    message: String,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

struct EchoEvents {
    read_tx: mpsc::Sender<Vec<u8>>,
}

impl StreamEvents for EchoEvents {
    fn read(&self, data: Result<&[u8], Error>) -> usize {
        match data {
            Ok(buf) => {
                let _ = self.read_tx.send(buf.to_vec());
                buf.len()
            }
            Err(err) => {
                eprintln!("stream error: {err}");
                0
            }
        }
    }

    fn write_ready(&self) {}
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    env_logger::Builder::new().filter(None, log_level).init();

    let platform = ThreadPlatform::new();
    let transport = LoopbackTransport::new();
    let (read_tx, read_rx) = mpsc::channel();
    let events = Arc::new(EchoEvents { read_tx });

    let stream = Stream::client(&*platform, transport, None, events);

    let (open_tx, open_rx) = mpsc::channel();
    stream.open(move |res| {
        let _ = open_tx.send(res);
    })?;
    open_rx.recv_timeout(Duration::from_secs(5))??;
    info!("stream open to {}", stream.remote_addr_str());

    stream.write(cli.message.as_bytes())?;
    stream.set_read_enabled(true);

    let echoed = read_rx.recv_timeout(Duration::from_secs(5))?;
    println!("echoed: {}", String::from_utf8_lossy(&echoed));

    let (close_tx, close_rx) = mpsc::channel();
    stream.close(move || {
        let _ = close_tx.send(());
    })?;
    close_rx.recv_timeout(Duration::from_secs(5))?;
    info!("stream closed");
    stream.release();

    Ok(())
}
