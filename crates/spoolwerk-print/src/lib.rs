// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwerk print: IPP listeners, job ingestion and spool, the delivery
// dispatcher, payload normalization, printer transports and rediscovery.
// This crate bridges between the core domain types defined in
// `spoolwerk-core` and the network printing infrastructure.

pub mod advertise;
pub mod dedicated;
pub mod diagnostics;
pub mod discovery;
pub mod dispatcher;
pub mod ingest;
pub mod ipp_client;
pub mod listener;
pub mod lpr_client;
pub mod normalize;
pub mod raw_client;
pub mod retry;
pub mod spool;
pub mod store;
pub mod transport;
pub mod wire;

pub use advertise::Advertiser;
pub use dedicated::{DedicatedPorts, PortReleaser};
pub use discovery::rediscover::Rediscovery;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use ingest::Ingestor;
pub use listener::{ConnectionHandler, SharedListener};
pub use spool::Spool;
pub use store::SqliteStore;
pub use transport::Transport;
