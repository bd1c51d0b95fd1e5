//! Multi-Target Wallet Snapshot Monitor
//!
//! Continuously watches a rotating set of wallet addresses over a streaming
//! market-data WebSocket, varying transport fingerprints and egress identity
//! between sessions, and durably persists each matched account snapshot.

pub mod circuit;
pub mod config;
pub mod fingerprint;
pub mod monitor;
pub mod parser;
pub mod rotation;
pub mod session;
pub mod storage;
pub mod tunnel;
pub mod wallets;
