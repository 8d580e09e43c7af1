// src/main.rs - Node entry point

use anyhow::Result;
use bsq_dao::block_source::DirectoryBlockSource;
use bsq_dao::cli::{Cli, Commands};
use bsq_dao::config;
use bsq_dao::node::{Collaborators, DaoNode};
use bsq_dao::p2p::DisconnectedTransport;
use bsq_dao::storage::DaoStore;
use bsq_dao::wallet::WatchOnlyWallet;
use clap::Parser;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    let cli = Cli::parse();
    let loaded_config = config::load(&cli.config)?;
    let db_path = cli.data_dir.clone().unwrap_or_else(|| loaded_config.node.db_path.clone());

    let store = DaoStore::open(&db_path)?;
    let wallet = Arc::new(WatchOnlyWallet);
    let collaborators = Collaborators {
        wallet: wallet.clone(),
        broadcaster: wallet,
        transport: Arc::new(DisconnectedTransport),
    };
    let mut node = DaoNode::new(loaded_config.dao.clone(), store, collaborators)?;
    node.start()?;

    match cli.command {
        Commands::Replay { blocks_dir } => {
            let dir = blocks_dir.unwrap_or_else(|| loaded_config.node.blocks_dir.clone());
            let mut source = DirectoryBlockSource::new(&dir);
            let added = node.sync_from(&mut source)?;
            info!("Replay finished: {} blocks added, chain height {}.", added, node.state().chain_height());
            print_status(&node);
        }
        Commands::Follow { blocks_dir, poll_secs } => {
            let dir = blocks_dir.unwrap_or_else(|| loaded_config.node.blocks_dir.clone());
            let interval = Duration::from_secs(poll_secs.unwrap_or(loaded_config.node.poll_interval_secs).max(1));
            let mut source = DirectoryBlockSource::new(&dir);
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received.");
                    shutdown_tx.send(()).ok();
                }
            });
            node.run(&mut source, interval, shutdown_rx).await?;
        }
        Commands::Status => print_status(&node),
    }

    Ok(())
}

fn print_status(node: &DaoNode) {
    let state = node.state();
    let period = state.period();
    println!("Chain height:      {}", state.chain_height());
    println!("Current phase:     {:?}", period.current_phase());
    println!("Cycles:            {}", state.cycles().len());
    println!("Unspent outputs:   {}", state.unspent_count());
    println!("Unspent BSQ:       {}", state.total_unspent_bsq());
    println!("Burnt fees:        {}", state.total_burnt_fee());
    println!("Issued BSQ:        {}", state.total_issued());
    println!("Ballots:           {}", node.proposals().ballots().len());
    println!("Own votes:         {}", node.my_votes().my_votes().len());
}
