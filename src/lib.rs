//! Out-of-band rendezvous for reliable-datagram fabric endpoints.
//!
//! Two peers meet over a plain TCP connection, swap their fabric endpoint names, and from then on
//! coordinate with a barrier that keeps the fabric's completion queue moving while it waits. A
//! [`Session`] owns all of it for one run.

pub mod barrier;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod message;
pub mod oob;
pub mod progress;
pub mod session;

pub use barrier::Rendezvous;
pub use config::Config;
pub use error::{Error, FabricError, Result};
pub use exchange::{exchange_addresses, PeerAddress};
pub use fabric::{Endpoint, EndpointAddr, FabricAddr, FabricConfig};
pub use oob::{OobChannel, Role, Token};
pub use progress::{Clock, MonotonicClock, PollPolicy, Waiter};
pub use session::{run_demo, Outcome, Session};
