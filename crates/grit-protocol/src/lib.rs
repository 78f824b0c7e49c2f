//! The smart transfer protocol.
//!
//! Peer state machines for upload-pack and receive-pack on the serving
//! side, fetch and push on the client side, plus the protocol v2 fetch
//! client. Everything operates on plain `Read`/`Write` byte streams; the
//! surrounding transport (TCP, SSH, HTTP) is somebody else's problem.

pub mod capability;
pub mod fetch;
pub mod pktline;
pub mod push;
pub mod receive_pack;
pub mod shallow;
pub mod sideband;
pub mod upload_pack;
pub mod v2;

/// Agent string advertised in capability lists.
pub const AGENT: &str = "agent=grit/0.1";

/// Errors from protocol sessions.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("the remote end hung up unexpectedly")]
    Hangup,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("capability not negotiated: {0}")]
    CapabilityMissing(String),

    #[error(transparent)]
    Pack(#[from] grit_pack::PackError),

    #[error(transparent)]
    Odb(#[from] grit_odb::OdbError),

    #[error(transparent)]
    Ref(#[from] grit_ref::RefError),

    #[error(transparent)]
    RevWalk(#[from] grit_revwalk::RevWalkError),

    #[error(transparent)]
    Hash(#[from] grit_hash::HashError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
