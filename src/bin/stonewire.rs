// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use stonewire::{setup_local_tracing, AppError, AppResult, Transport, TransportConfig};
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser)]
pub enum Command {
    /// Run the sum service: each request "a,b" is answered with "a+b"
    Serve,
    /// Ask a running sum service to add two numbers
    Sum { a: i64, b: i64 },
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = if config_path.exists() {
        TransportConfig::set_up_config(&config_path)?
    } else {
        TransportConfig::default()
    };

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    setup_local_tracing()?;
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    match commandline.command {
        Some(Command::Sum { a, b }) => rt.block_on(sum(config, a, b)),
        _ => rt.block_on(serve(config)),
    }
}

async fn serve(config: TransportConfig) -> AppResult<()> {
    let addr = config.network.listen_address()?;
    let transport = Transport::new(config)?;
    transport.on_data(|message| async move {
        let reply = add(message.payload())?;
        message.reply(reply).await
    });
    let listener = transport.listen(addr).await?;

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    listener.stop().await;
    transport.shutdown().await;
    Ok(())
}

async fn sum(config: TransportConfig, a: i64, b: i64) -> AppResult<()> {
    let addr: SocketAddr = config.network.listen_address()?;
    let transport = Transport::new(config)?;
    let session = transport.connect(addr).await?;
    let reply = session.request(format!("{},{}", a, b)).await?;
    println!("{}", String::from_utf8_lossy(&reply));
    transport.close_session(&session).await;
    Ok(())
}

fn add(payload: &[u8]) -> AppResult<String> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| AppError::HandlerError("request is not utf-8".into()))?;
    let (a, b) = text
        .split_once(',')
        .ok_or_else(|| AppError::HandlerError(format!("expected \"a,b\", got {:?}", text)))?;
    let parse = |n: &str| {
        n.trim()
            .parse::<i64>()
            .map_err(|e| AppError::HandlerError(format!("{:?}: {}", n, e)))
    };
    Ok((parse(a)? + parse(b)?).to_string())
}
