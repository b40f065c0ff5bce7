//! Sequential HTTP/HTTPS proxying over a single ship-to-shore TCP link.
//!
//! Two processes cooperate across one long-lived TCP connection: the ship
//! side ([`ShipProxy`]) is an explicit HTTP proxy that serialises all local
//! requests onto the link, and the offshore side ([`OffshoreProxy`]) makes
//! the actual origin connections. At most one stream is in flight on the
//! link at any moment; CONNECT tunnels stay full-duplex within that one
//! stream.

/// Frame codec for the link protocol.
pub mod frame;
/// Ship-side link session and stream state machine.
pub mod link;
/// Listener plumbing shared by the binaries.
pub mod net;
/// Offshore dispatcher: accepts the link and dials origins.
pub mod offshore;
mod parse;
/// Ship-side proxy listener, scheduler, and request handlers.
pub mod ship;
mod util;

pub use frame::{Frame, FrameError, FrameKind, StreamKind};
pub use link::{LinkError, LinkOpts, LinkSession, StreamState};
pub use offshore::{OffshoreOpts, OffshoreProxy};
pub use parse::{Authority, BodyMode, ParseError, RequestHead, ResponseHead};
pub use ship::{ShipOpts, ShipProxy};

/// How much data to read for a request or response head before it's considered invalid.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

#[cfg(test)]
mod tests;
