//! State transfer encoding
//!
//! A joining node receives the active-database set as a big-endian `i32`
//! count followed by one length-prefixed modified UTF-8 string per id, the
//! layout produced by `DataOutput.writeUTF`.

use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Encode a set of database ids
pub fn encode_active_databases(databases: &BTreeSet<String>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let count = i32::try_from(databases.len())
        .map_err(|_| Error::StateTransfer("Too many active databases".into()))?;
    buf.write_i32::<BigEndian>(count)?;
    for id in databases {
        write_utf(&mut buf, id)?;
    }
    Ok(buf)
}

/// Decode a set of database ids
pub fn decode_active_databases(bytes: &[u8]) -> Result<BTreeSet<String>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor
        .read_i32::<BigEndian>()
        .map_err(|_| Error::StateTransfer("Truncated database count".into()))?;
    if count < 0 {
        return Err(Error::StateTransfer(format!("Negative database count {}", count)));
    }

    let mut databases = BTreeSet::new();
    for _ in 0..count {
        databases.insert(read_utf(&mut cursor)?);
    }

    if (cursor.position() as usize) != bytes.len() {
        return Err(Error::StateTransfer(format!(
            "{} trailing bytes after {} database ids",
            bytes.len() - cursor.position() as usize,
            count
        )));
    }

    Ok(databases)
}

/// Write one string as `u16` byte length + modified UTF-8
pub fn write_utf(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let mut encoded = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => encoded.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                encoded.push(0xC0 | (unit >> 6) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                encoded.push(0xE0 | (unit >> 12) as u8);
                encoded.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                encoded.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }

    let len = u16::try_from(encoded.len()).map_err(|_| {
        Error::StateTransfer(format!("Encoded id is {} bytes, limit is 65535", encoded.len()))
    })?;
    buf.write_u16::<BigEndian>(len)?;
    buf.extend_from_slice(&encoded);
    Ok(())
}

/// Read one `u16`-prefixed modified UTF-8 string
pub fn read_utf(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| Error::StateTransfer("Truncated string length".into()))?;
    let mut bytes = vec![0u8; len as usize];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| Error::StateTransfer(format!("Truncated string of {} bytes", len)))?;

    let malformed = |at: usize| Error::StateTransfer(format!("Malformed modified UTF-8 at byte {}", at));

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let continuation = |k: usize| -> Result<u16> {
            match bytes.get(i + k) {
                Some(c) if c & 0xC0 == 0x80 => Ok((c & 0x3F) as u16),
                _ => Err(malformed(i + k)),
            }
        };

        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            units.push(((b & 0x1F) as u16) << 6 | continuation(1)?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            units.push(((b & 0x0F) as u16) << 12 | continuation(1)? << 6 | continuation(2)?);
            i += 3;
        } else {
            return Err(malformed(i));
        }
    }

    String::from_utf16(&units).map_err(|e| Error::StateTransfer(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_layout() {
        let bytes = encode_active_databases(&set(&["db1", "db2"])).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 2, 0, 3, b'd', b'b', b'1', 0, 3, b'd', b'b', b'2']
        );
        assert_eq!(decode_active_databases(&bytes).unwrap(), set(&["db1", "db2"]));
    }

    #[test]
    fn test_empty_set() {
        let bytes = encode_active_databases(&BTreeSet::new()).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert!(decode_active_databases(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_nul_uses_two_bytes() {
        let mut buf = Vec::new();
        write_utf(&mut buf, "a\0b").unwrap();
        assert_eq!(buf, vec![0, 4, b'a', 0xC0, 0x80, b'b']);
    }

    #[test]
    fn test_supplementary_character_uses_surrogate_pair() {
        let mut buf = Vec::new();
        write_utf(&mut buf, "\u{1F600}").unwrap();
        assert_eq!(buf, vec![0, 6, 0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]);

        let mut cursor = Cursor::new(buf.as_slice());
        assert_eq!(read_utf(&mut cursor).unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_non_ascii_ids() {
        let ids = set(&["réplica-ü", "数据库", "a\0b"]);
        let bytes = encode_active_databases(&ids).unwrap();
        assert_eq!(decode_active_databases(&bytes).unwrap(), ids);
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            decode_active_databases(&[0, 0]),
            Err(Error::StateTransfer(_))
        ));
        assert!(matches!(
            decode_active_databases(&[0, 0, 0, 1, 0, 5, b'a']),
            Err(Error::StateTransfer(_))
        ));
        assert!(matches!(
            decode_active_databases(&[0, 0, 0, 1, 0, 1, 0xFF]),
            Err(Error::StateTransfer(_))
        ));
        assert!(matches!(
            decode_active_databases(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(Error::StateTransfer(_))
        ));
        assert!(matches!(
            decode_active_databases(&[0, 0, 0, 0, 7]),
            Err(Error::StateTransfer(_))
        ));
    }
}
