//! RAET road: the protocol engine behind a secure datagram endpoint.
//!
//! ## Architecture
//!
//! - **estate**: the local identity and the remotes it knows
//! - **directory**: uid/name/address tables for remotes
//! - **keep**: durable road and safe documents per estate
//! - **transaction**: Join, Allow and Message exchanges as state machines
//! - **stack**: [`RoadStack`], the single-writer tick that drives them all
//! - **lane**: [`LaneStack`], paged messaging over unix datagram sockets
//! - **transport**, **clock**, **retry**: the seams tests drive directly

pub mod clock;
pub mod config;
pub mod directory;
pub mod estate;
pub mod keep;
#[cfg(unix)]
pub mod lane;
pub mod retry;
pub mod stack;
pub mod transaction;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::load_config;
pub use estate::{LocalEstate, RemoteEstate};
pub use keep::{Keep, KeepError};
#[cfg(unix)]
pub use lane::LaneStack;
pub use stack::{AcceptPolicy, Failure, Received, RoadStack, StackStats};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
