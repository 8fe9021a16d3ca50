// (c) 2024 Ross Younger

//! The measurement engine
//!
//! Everything in here talks to a [`Channel`](crate::channel::Channel) and nothing else;
//! it knows nothing about sockets, HTTP or the command line.
//!
//! * [`latency`] measures round-trip time, jitter and loss with a sequence of probes.
//! * [`session`] measures throughput in either direction, adapting chunk size and the number of
//!   parallel streams as it goes, and stopping early once the figures settle down.
//! * [`rate`] and [`stats`] hold the arithmetic behind both.
//! * [`result`] defines what each test reports; [`quality`] turns a full set of results into a verdict.

pub mod latency;
pub mod quality;
pub mod rate;
pub mod result;
pub mod session;
pub mod stats;
