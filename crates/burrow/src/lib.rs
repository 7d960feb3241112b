//! Encrypted multiplexed peer sessions with routing and port forwarding.
//!
//! The binary runs [`run`]; in-process callers dial, listen and manage
//! routes through [`comm`].

mod burrow;

pub use burrow::{comm, config, net, run};
