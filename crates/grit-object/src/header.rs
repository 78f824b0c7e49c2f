//! The `"<type> <decimal-length>\0"` framing header.

use crate::{ObjectError, ObjectType};

/// Parse a framing header. Returns `(type, body_size, header_len)` where
/// `header_len` includes the NUL terminator.
pub fn parse_header(data: &[u8]) -> Result<(ObjectType, usize, usize), ObjectError> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ObjectError::InvalidHeader("missing NUL terminator".into()))?;

    let header = &data[..nul];
    let space = header
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| ObjectError::InvalidHeader("missing space".into()))?;

    let obj_type = ObjectType::from_bytes(&header[..space])?;

    let size_str = std::str::from_utf8(&header[space + 1..])
        .map_err(|_| ObjectError::InvalidHeader("non-ASCII length".into()))?;
    if size_str.is_empty() || size_str.bytes().any(|b| !b.is_ascii_digit()) {
        return Err(ObjectError::InvalidHeader(format!(
            "invalid length: {size_str:?}"
        )));
    }
    let size: usize = size_str
        .parse()
        .map_err(|_| ObjectError::InvalidHeader(format!("length out of range: {size_str}")))?;

    Ok((obj_type, size, nul + 1))
}

/// Serialize a framing header.
pub fn write_header(obj_type: ObjectType, body_size: usize) -> Vec<u8> {
    format!("{} {}\0", obj_type, body_size).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blob() {
        let (ty, size, len) = parse_header(b"blob 12\0hello world!").unwrap();
        assert_eq!(ty, ObjectType::Blob);
        assert_eq!(size, 12);
        assert_eq!(len, 8);
    }

    #[test]
    fn roundtrip() {
        let hdr = write_header(ObjectType::Tree, 0);
        let (ty, size, len) = parse_header(&hdr).unwrap();
        assert_eq!((ty, size, len), (ObjectType::Tree, 0, hdr.len()));
    }

    #[test]
    fn missing_nul() {
        assert!(parse_header(b"blob 12").is_err());
    }

    #[test]
    fn missing_space() {
        assert!(parse_header(b"blob12\0").is_err());
    }

    #[test]
    fn negative_length_rejected() {
        assert!(parse_header(b"blob -1\0").is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(parse_header(b"woof 3\0abc").is_err());
    }
}
