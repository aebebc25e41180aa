mod collector;
mod command;
mod config;
mod display;
mod netlink;
mod scheduler;
mod system;
mod utils;

use clap::Parser;
use command::{run, Opt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    run(opt).await?;
    Ok(())
}
