//! Binary snapshot format (little-endian):
//!
//! ```text
//! [u32 magic = "THR1"][u32 version = 1][u32 session count]
//! repeated per session:
//!   [u32 len][session id bytes][u8 enforced level][u32 active count]
//!   repeated per active observer:
//!     [u32 len][observer name bytes]
//! ```

use thiserror::Error;
use throttle_arbiter_core::PriorityLevel;
use throttle_arbiter_supervisor::{SessionSnapshot, SupervisorSnapshot};

pub const SNAP_MAGIC: u32 = 0x3152_4854; // "THR1" little-endian
pub const SNAP_VERSION: u32 = 1;
pub const SNAP_HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("string is not valid utf-8")]
    Utf8,
    #[error("invalid priority level code {0}")]
    BadLevel(u8),
    #[error("bad snapshot magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

impl SnapshotError {
    /// Negative return code reported over FFI.
    pub fn rc(&self) -> i32 {
        match self {
            Self::Truncated => -2,
            Self::Utf8 => -5,
            Self::BadMagic(_) => -8,
            Self::UnsupportedVersion(_) => -9,
            Self::BadLevel(_) => -10,
        }
    }
}

pub fn encode(snap: &SupervisorSnapshot) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    buf.extend_from_slice(&SNAP_MAGIC.to_le_bytes());
    buf.extend_from_slice(&SNAP_VERSION.to_le_bytes());
    buf.extend_from_slice(&(snap.sessions.len() as u32).to_le_bytes());

    for (id, st) in &snap.sessions {
        put_str(&mut buf, id);
        buf.push(st.enforced_level.as_u8());
        buf.extend_from_slice(&(st.active.len() as u32).to_le_bytes());
        for name in &st.active {
            put_str(&mut buf, name);
        }
    }
    buf
}

pub fn decode(data: &[u8]) -> Result<SupervisorSnapshot, SnapshotError> {
    let mut r = Reader { data, pos: 0 };

    let magic = r.u32()?;
    if magic != SNAP_MAGIC {
        return Err(SnapshotError::BadMagic(magic));
    }
    let ver = r.u32()?;
    if ver != SNAP_VERSION {
        return Err(SnapshotError::UnsupportedVersion(ver));
    }

    let count = r.u32()? as usize;
    // Each session needs at least 9 bytes; cap the preallocation accordingly.
    let mut sessions = Vec::with_capacity(count.min(data.len() / 9));
    for _ in 0..count {
        let id = r.string()?;
        let code = r.u8()?;
        let enforced_level = PriorityLevel::from_u8(code).ok_or(SnapshotError::BadLevel(code))?;
        let n_active = r.u32()? as usize;
        let mut active = Vec::with_capacity(n_active.min(data.len() / 4));
        for _ in 0..n_active {
            active.push(r.string()?);
        }
        sessions.push((
            id,
            SessionSnapshot {
                enforced_level,
                active,
            },
        ));
    }

    Ok(SupervisorSnapshot { sessions })
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self.pos.checked_add(n).ok_or(SnapshotError::Truncated)?;
        let out = self.data.get(self.pos..end).ok_or(SnapshotError::Truncated)?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, SnapshotError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| SnapshotError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_header() {
        assert_eq!(decode(&[1, 2, 3]), Err(SnapshotError::Truncated));

        let mut buf = encode(&SupervisorSnapshot::default());
        buf[0] ^= 0xff;
        assert!(matches!(decode(&buf), Err(SnapshotError::BadMagic(_))));

        let mut buf = encode(&SupervisorSnapshot::default());
        buf[4] = 7;
        assert_eq!(decode(&buf), Err(SnapshotError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_bad_level_and_truncation() {
        let snap = SupervisorSnapshot {
            sessions: vec![(
                "s".to_string(),
                SessionSnapshot {
                    enforced_level: PriorityLevel::High,
                    active: vec!["media".to_string()],
                },
            )],
        };
        let buf = encode(&snap);
        assert_eq!(decode(&buf), Ok(snap));

        // Level byte follows header + len + "s".
        let mut bad = buf.clone();
        bad[SNAP_HEADER_LEN + 4 + 1] = 42;
        assert_eq!(decode(&bad), Err(SnapshotError::BadLevel(42)));

        assert_eq!(decode(&buf[..buf.len() - 1]), Err(SnapshotError::Truncated));
    }
}
