//! Library crate for shardproxy: routing workers, backend connections and the
//! persistent connection pool of a MySQL/MariaDB proxy.
//!
//! The **binary** (`main.rs`) wires a [`proxy::ProxyService`] to a TCP
//! listener and runs the worker registry until SIGINT/SIGTERM. Everything it
//! uses lives here so workers can be driven directly from tests: a
//! [`worker::RoutingWorker`] built with `standalone` is polled by hand with
//! `poll_once` instead of running on its own thread.

pub mod auth;
pub mod backend;
pub mod config;
pub mod constants;
pub mod dcb;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod poll;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod reply;
pub mod server;
pub mod session;
pub mod worker;

pub use error::{Error, Result};
