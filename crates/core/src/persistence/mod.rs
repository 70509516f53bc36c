//! Persistence (C4): atomic checkpoint write/read and the backup-controller
//! heartbeat file, per spec.md §4.3 and §6.

pub mod codec;
pub mod heartbeat;

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::block::{Block, BlockState};
use crate::common::constants::BLOCK_STATE_VERSION;
use crate::error::Result;
use crate::registry::{ListFilter, Registry};

/// A decoded checkpoint: version header, record count, save time, and the
/// packed block records.
#[derive(Debug)]
pub struct Checkpoint {
    pub version: String,
    pub timestamp: i64,
    pub blocks: Vec<Block>,
}

/// Builds a checkpoint from the registry's current `main` list. On
/// hardware only `error`-state blocks are worth persisting (the controller
/// owns the rest); on an emulated system every block is, since there is no
/// controller to reconcile against at the next startup.
pub fn build_checkpoint(registry: &Registry, emulated: bool, now: i64) -> Checkpoint {
    let blocks = registry
        .list(ListFilter::Main)
        .into_iter()
        .filter(|b| emulated || b.state == BlockState::Error)
        .collect();
    Checkpoint { version: BLOCK_STATE_VERSION.to_string(), timestamp: now, blocks }
}

fn encode(cp: &Checkpoint) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(cp.version.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(&(cp.blocks.len() as u32).to_be_bytes());
    buf.extend_from_slice(&cp.timestamp.to_be_bytes());
    for b in &cp.blocks {
        codec::pack_block(&mut buf, b)?;
    }
    Ok(buf)
}

fn decode(bytes: &[u8]) -> Result<Option<Checkpoint>> {
    let Some(nl) = bytes.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let version = String::from_utf8_lossy(&bytes[..nl]).to_string();
    if version != BLOCK_STATE_VERSION {
        // Legacy (VER001) or unknown version: ignored, never migrated, per spec.md §4.3.
        return Ok(None);
    }
    let mut cursor = &bytes[nl + 1..];
    let mut count_buf = [0u8; 4];
    cursor.read_exact(&mut count_buf)?;
    let count = u32::from_be_bytes(count_buf);
    let mut ts_buf = [0u8; 8];
    cursor.read_exact(&mut ts_buf)?;
    let timestamp = i64::from_be_bytes(ts_buf);
    let mut blocks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        blocks.push(codec::unpack_block(&mut cursor)?);
    }
    Ok(Some(Checkpoint { version, timestamp, blocks }))
}

/// Writes the checkpoint to `<dir>/block_state` using the tmp -> link ->
/// rename dance of spec.md §4.3, so that at any crash point at least one
/// valid copy exists on disk:
///
/// 1. write `<dir>/block_state.new`, `fsync`
/// 2. unlink the old `.old` tombstone
/// 3. hard-link `block_state -> block_state.old`
/// 4. unlink `block_state`
/// 5. hard-link `block_state.new -> block_state`
/// 6. unlink `block_state.new`
pub fn write_checkpoint(dir: &Path, cp: &Checkpoint) -> Result<()> {
    fs::create_dir_all(dir)?;
    let state = dir.join("block_state");
    let old = dir.join("block_state.old");
    let new = dir.join("block_state.new");

    let bytes = encode(cp)?;
    {
        let mut f = File::create(&new)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }

    let _ = fs::remove_file(&old);
    if state.exists() {
        fs::hard_link(&state, &old)?;
    }
    let _ = fs::remove_file(&state);
    fs::hard_link(&new, &state)?;
    fs::remove_file(&new)?;
    Ok(())
}

/// Reads `<dir>/block_state`. A version mismatch (or missing file) is not
/// an error: the file is simply ignored, per spec.md §4.3 — there is no
/// migration path.
pub fn read_checkpoint(dir: &Path) -> Result<Option<Checkpoint>> {
    let state = dir.join("block_state");
    let bytes = match fs::read(&state) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode(&bytes)
}

/// Merges every block from a checkpoint into the registry by id,
/// overwriting any block already present under that id.
pub fn merge_into(registry: &Registry, cp: Checkpoint) {
    for b in cp.blocks {
        registry.insert(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BootState, ConnType, Images, JobRunning};
    use crate::common::Coord;

    fn sample_block(id: &str) -> Block {
        Block {
            id: id.into(),
            nodes: vec![Coord::new(0, 0, 0)],
            ionodes: None,
            geometry: (1, 1, 1),
            start: Coord::new(0, 0, 0),
            conn_type: ConnType::Torus,
            node_cnt: 512,
            cpu_cnt: 2048,
            images: Images::default(),
            state: BlockState::Error,
            boot_state: BootState::Idle,
            boot_count: 0,
            job_running: JobRunning::None,
            user_name: None,
            target_name: None,
            modifying: false,
            full_block: false,
        }
    }

    #[test]
    fn write_then_read_roundtrips_error_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.insert(sample_block("RMP000"));
        let cp = build_checkpoint(&registry, false, 1_700_000_000);
        write_checkpoint(dir.path(), &cp).unwrap();

        let read_back = read_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(read_back.blocks.len(), 1);
        assert_eq!(read_back.blocks[0].id, "RMP000");
        assert!(dir.path().join("block_state").exists());
    }

    #[test]
    fn second_write_produces_an_old_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.insert(sample_block("A"));
        write_checkpoint(dir.path(), &build_checkpoint(&registry, false, 1)).unwrap();
        registry.insert(sample_block("B"));
        write_checkpoint(dir.path(), &build_checkpoint(&registry, false, 2)).unwrap();
        assert!(dir.path().join("block_state.old").exists());
        assert!(!dir.path().join("block_state.new").exists());
    }

    #[test]
    fn unknown_version_is_silently_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("block_state"), b"VER999\nbogus").unwrap();
        assert!(read_checkpoint(dir.path()).unwrap().is_none());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_checkpoint(dir.path()).unwrap().is_none());
    }
}
