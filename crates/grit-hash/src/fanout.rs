//! Pack index fan-out table.

use crate::{HashError, ObjectId};

/// 256-entry cumulative fan-out table.
///
/// Entry `i` holds the number of objects whose first digest byte is `<= i`;
/// a lookup narrows the binary search to the bucket of the OID's first byte.
#[derive(Debug)]
pub struct Fanout {
    table: [u32; 256],
}

impl Fanout {
    /// Build from a **sorted** slice of OIDs. Order is not re-verified here.
    pub fn build(sorted: &[ObjectId]) -> Self {
        let mut table = [0u32; 256];
        for oid in sorted {
            table[oid.first_byte() as usize] += 1;
        }
        for i in 1..256 {
            table[i] += table[i - 1];
        }
        Self { table }
    }

    /// Index range of OIDs whose first byte equals `first`.
    pub fn bucket(&self, first: u8) -> std::ops::Range<usize> {
        let end = self.table[first as usize] as usize;
        let start = match first {
            0 => 0,
            _ => self.table[first as usize - 1] as usize,
        };
        start..end
    }

    /// Total object count (the last entry).
    pub fn total(&self) -> u32 {
        self.table[255]
    }

    /// Parse the on-disk form: 256 big-endian u32 values.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HashError> {
        if data.len() < 1024 {
            return Err(HashError::InvalidDigestLength {
                expected: 1024,
                actual: data.len(),
            });
        }
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let chunk: [u8; 4] = data[i * 4..i * 4 + 4].try_into().expect("4-byte chunk");
            *entry = u32::from_be_bytes(chunk);
        }
        for i in 1..256 {
            if table[i] < table[i - 1] {
                return Err(HashError::InvalidDigestLength {
                    expected: table[i - 1] as usize,
                    actual: table[i] as usize,
                });
            }
        }
        Ok(Self { table })
    }

    /// Serialize to the on-disk form (1024 bytes).
    pub fn to_bytes(&self) -> [u8; 1024] {
        let mut buf = [0u8; 1024];
        for (i, entry) in self.table.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&entry.to_be_bytes());
        }
        buf
    }
}
