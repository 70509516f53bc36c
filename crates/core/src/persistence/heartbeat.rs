//! The two-word heartbeat file in `StateSaveLocation` (spec.md §6), read by
//! the backup-controller detector: big-endian `(timestamp, server_index)`.

use std::fs;
use std::path::Path;

use crate::error::Result;

/// Writes the heartbeat file, overwriting any previous contents.
pub fn write_heartbeat(dir: &Path, timestamp: i64, server_index: i64) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&timestamp.to_be_bytes());
    bytes.extend_from_slice(&server_index.to_be_bytes());
    fs::write(dir.join("heartbeat"), bytes)?;
    Ok(())
}

/// Reads `(timestamp, server_index)`, or `None` if the file is absent or
/// short.
pub fn read_heartbeat(dir: &Path) -> Result<Option<(i64, i64)>> {
    let bytes = match fs::read(dir.join("heartbeat")) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < 16 {
        return Ok(None);
    }
    let mut ts_buf = [0u8; 8];
    let mut idx_buf = [0u8; 8];
    ts_buf.copy_from_slice(&bytes[0..8]);
    idx_buf.copy_from_slice(&bytes[8..16]);
    Ok(Some((i64::from_be_bytes(ts_buf), i64::from_be_bytes(idx_buf))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        write_heartbeat(dir.path(), 1_700_000_000, 1).unwrap();
        let (ts, idx) = read_heartbeat(dir.path()).unwrap().unwrap();
        assert_eq!(ts, 1_700_000_000);
        assert_eq!(idx, 1);
    }

    #[test]
    fn missing_heartbeat_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_heartbeat(dir.path()).unwrap().is_none());
    }
}
