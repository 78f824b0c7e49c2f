//! Capability sets.
//!
//! The capability list rides after a NUL on the first advertisement line
//! and again on the client's first `want`/update line. The negotiated set
//! is the session's feature switchboard: every FSM branch consults it.

use std::fmt;

/// An order-preserving set of capability tags, some carrying `=values`.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    entries: Vec<(String, Option<String>)>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space-separated capability string.
    pub fn parse(s: &str) -> Self {
        let mut caps = Self::new();
        for token in s.split_whitespace() {
            match token.split_once('=') {
                Some((name, value)) => caps.set(name, Some(value)),
                None => caps.set(token, None),
            }
        }
        caps
    }

    /// Add or replace a capability.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.map(str::to_string),
            None => self
                .entries
                .push((name.to_string(), value.map(str::to_string))),
        }
    }

    pub fn add(&mut self, name: &str) {
        self.set(name, None);
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ack policy this session negotiated.
    pub fn ack_mode(&self) -> AckMode {
        if self.has("multi_ack_detailed") {
            AckMode::MultiAckDetailed
        } else if self.has("multi_ack") {
            AckMode::MultiAck
        } else {
            AckMode::Single
        }
    }

    /// Which sideband framing to use, preferring the 64k variant.
    pub fn sideband(&self) -> Option<usize> {
        if self.has("side-band-64k") {
            Some(crate::pktline::MAX_PKT_PAYLOAD - 1)
        } else if self.has("side-band") {
            Some(999)
        } else {
            None
        }
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match value {
                Some(v) => write!(f, "{name}={v}")?,
                None => f.write_str(name)?,
            }
        }
        Ok(())
    }
}

/// ACK policy selected by the capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Single,
    MultiAck,
    MultiAckDetailed,
}

/// Split `<payload>\0<caps>` into the payload and its capability set.
pub fn split_caps(line: &[u8]) -> (&[u8], Capabilities) {
    match line.iter().position(|&b| b == 0) {
        Some(nul) => {
            let caps = Capabilities::parse(&String::from_utf8_lossy(&line[nul + 1..]));
            (&line[..nul], caps)
        }
        None => (line, Capabilities::new()),
    }
}
