// Newline-delimited JSON dumps of the canonical chain.
use crate::block::Block;
use crate::blockchain::{AcceptOutcome, Blockchain};
use crate::db::MemoryStore;
use anyhow::{Context, Result, bail};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const EXPORT_BATCH: u64 = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub accepted: usize,
    pub skipped: usize,
}

/// Write canonical blocks from `from_height` up to the head, one per line.
pub fn export_chain<W: Write>(chain: &Blockchain, writer: W, from_height: u64) -> Result<usize> {
    let mut writer = BufWriter::new(writer);
    let mut written = 0;
    let mut height = from_height;
    loop {
        let blocks = chain.blocks_range(height, EXPORT_BATCH)?;
        if blocks.is_empty() {
            break;
        }
        for block in &blocks {
            serde_json::to_writer(&mut writer, block)?;
            writer.write_all(b"\n")?;
        }
        written += blocks.len();
        height += blocks.len() as u64;
    }
    writer.flush()?;
    Ok(written)
}

/// Export into `path`, appending after the last block already there.
pub fn export_to_file(chain: &Blockchain, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let from_height = match last_exported(path)? {
        Some(last) => {
            if chain.hash_at_height(last.header.idx)?.as_deref() != Some(last.block_hash.as_str()) {
                bail!(
                    "{} ends with block {} which is not on the local chain",
                    path.display(),
                    last.block_hash
                );
            }
            last.header.idx + 1
        }
        None => 0,
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let written = export_chain(chain, file, from_height)?;
    log::info!(
        "Exported {} blocks from height {} to {}",
        written,
        from_height,
        path.display()
    );
    Ok(written)
}

fn last_exported(path: &Path) -> Result<Option<Block>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last.map(|l| serde_json::from_str(&l).context("decoding last exported block"))
        .transpose()
}

/// Feed every block in `reader` to the validator. Blocks already stored
/// are skipped; the first rejection aborts the import.
pub fn import_chain<R: BufRead>(chain: &mut Blockchain, reader: R) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let block: Block = serde_json::from_str(&line)
            .with_context(|| format!("line {}: malformed block", lineno + 1))?;
        if chain.has_block(&block.block_hash)? {
            summary.skipped += 1;
            continue;
        }
        chain
            .accept_block(&block)
            .with_context(|| format!("line {}: block {} rejected", lineno + 1, block.block_hash))?;
        summary.accepted += 1;
    }
    log::info!(
        "Import finished: {} accepted, {} already present",
        summary.accepted,
        summary.skipped
    );
    Ok(summary)
}

/// Replay the canonical chain into a scratch in-memory chain under the same
/// consensus parameters. Returns the replayed height; fails on the first
/// block the validator refuses.
pub fn validate_chain(chain: &Blockchain) -> Result<u64> {
    let mut scratch = Blockchain::open(Box::new(MemoryStore::new()), chain.params().clone())?;
    let mut height = 1;
    loop {
        let blocks = chain.blocks_range(height, EXPORT_BATCH)?;
        if blocks.is_empty() {
            break;
        }
        for block in &blocks {
            let outcome = scratch.accept_block(block).with_context(|| {
                format!("height {}: block {} invalid", block.header.idx, block.block_hash)
            })?;
            if outcome != AcceptOutcome::Extended {
                bail!(
                    "height {}: block {} did not extend the replayed chain",
                    block.header.idx,
                    block.block_hash
                );
            }
        }
        height += blocks.len() as u64;
    }
    if scratch.head().hash != chain.head().hash {
        bail!(
            "replay ended at {} but the stored head is {}",
            scratch.head().hash,
            chain.head().hash
        );
    }
    log::info!("Validated {} blocks up to {}", scratch.head().height, scratch.head().hash);
    Ok(scratch.head().height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusParams;
    use crate::consensus;
    use crate::db::{RocksStore, Store, StoreBatch, block_key};
    use crate::wallet::Wallet;
    use std::sync::atomic::AtomicBool;

    fn grown(blocks: usize) -> Blockchain {
        let mut chain =
            Blockchain::open(Box::new(MemoryStore::new()), ConsensusParams::regtest()).unwrap();
        let miner = Wallet::generate();
        for _ in 0..blocks {
            extend(&mut chain, &miner);
        }
        chain
    }

    fn extend(chain: &mut Blockchain, miner: &Wallet) {
        let template = chain
            .block_template(miner.address(), &[], chain.head().timestamp + 600)
            .unwrap();
        let block = consensus::mine_at_fixed_time(template, &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        chain.accept_block(&block).unwrap();
    }

    fn empty() -> Blockchain {
        Blockchain::open(Box::new(MemoryStore::new()), ConsensusParams::regtest()).unwrap()
    }

    #[test]
    fn import_twice_equals_once() {
        let source = grown(3);
        let mut dump = Vec::new();
        assert_eq!(export_chain(&source, &mut dump, 0).unwrap(), 4);

        let mut target = empty();
        let first = import_chain(&mut target, dump.as_slice()).unwrap();
        assert_eq!(first, ImportSummary { accepted: 3, skipped: 1 });
        assert_eq!(target.head(), source.head());

        let second = import_chain(&mut target, dump.as_slice()).unwrap();
        assert_eq!(second, ImportSummary { accepted: 0, skipped: 4 });
        assert_eq!(target.head(), source.head());
    }

    #[test]
    fn file_export_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.ndjson");
        let mut chain = grown(2);
        assert_eq!(export_to_file(&chain, &path).unwrap(), 3);

        extend(&mut chain, &Wallet::generate());
        assert_eq!(export_to_file(&chain, &path).unwrap(), 1);
        assert_eq!(export_to_file(&chain, &path).unwrap(), 0);

        let mut restored = empty();
        let file = BufReader::new(File::open(&path).unwrap());
        import_chain(&mut restored, file).unwrap();
        assert_eq!(restored.head(), chain.head());
    }

    #[test]
    fn foreign_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.ndjson");
        export_to_file(&grown(1), &path).unwrap();
        assert!(export_to_file(&grown(1), &path).is_err());
    }

    #[test]
    fn stored_chain_replays_cleanly() {
        let chain = grown(3);
        assert_eq!(validate_chain(&chain).unwrap(), 3);
        assert_eq!(validate_chain(&empty()).unwrap(), 0);
    }

    #[test]
    fn altered_block_fails_replay() {
        let dir = tempfile::tempdir().unwrap();
        let miner = Wallet::generate();
        let target = {
            let mut chain = Blockchain::open_rocks(dir.path(), ConsensusParams::regtest()).unwrap();
            extend(&mut chain, &miner);
            extend(&mut chain, &miner);
            chain.block_at_height(2).unwrap().unwrap()
        };

        {
            let mut store = RocksStore::open(dir.path()).unwrap();
            let mut altered = target.clone();
            altered.txns[0].outflows[0].amount += 1;
            let mut batch = StoreBatch::default();
            batch.put_encoded(block_key(&target.block_hash), &altered).unwrap();
            store.write(batch).unwrap();
        }

        let chain = Blockchain::open_rocks(dir.path(), ConsensusParams::regtest()).unwrap();
        let err = validate_chain(&chain).unwrap_err();
        assert!(format!("{:#}", err).contains("height 2"));
    }

    #[test]
    fn bad_block_aborts_import() {
        let mut chain = empty();
        let err = import_chain(&mut chain, "{\"not\":\"a block\"}\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
