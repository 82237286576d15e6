//! Shared pieces of the voice transport client.
//!
//! This crate holds the stateless wire codecs for the UDP media plane (RTP
//! header, RTCP receiver reports, IP discovery) together with the tracing,
//! metrics and CLI helpers every binary uses.

pub mod cli;
pub mod error;
pub mod ip_discovery;
pub mod observability;
pub mod rtcp;
pub mod rtp;

pub use cli::ColorWhen;
pub use error::WireError;
pub use ip_discovery::IpDiscoveryPacket;
pub use observability::{init_tracing, DropReason, MetricsContext, MetricsServerConfig};
pub use rtcp::{ReportBlock, RtcpHeader};
pub use rtp::RtpHeader;
