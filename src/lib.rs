// src/lib.rs

// This file defines the BSQ DAO consensus library and its modules.

pub mod blind_vote;
pub mod block;
pub mod block_source;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod governance;
pub mod listener;
pub mod my_vote;
pub mod node;
pub mod opreturn;
pub mod p2p;
pub mod params;
pub mod parser;
pub mod period;
pub mod proposal;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod transaction;
pub mod vote_result;
pub mod vote_reveal;
pub mod wallet;
