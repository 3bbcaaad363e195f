//! Shogun Relay IPFS gateway client
//!
//! Thin adapter over the out-of-process content-addressed store (Kubo RPC
//! API). Every call carries a deadline; an elapsed deadline surfaces as
//! [`IpfsError::Timeout`], which callers treat as transient. Retries are
//! the caller's responsibility.

pub mod client;
pub mod error;

pub use client::{AddOptions, AddOutcome, AddedEntry, IpfsClient, PinType};
pub use error::{IpfsError, Result};
