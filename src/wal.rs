use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Txn;

/// Encode a single transaction to [len][bincode][crc32] format.
fn encode_txn(writer: &mut impl Write, txn: &Txn) -> io::Result<()> {
    let payload =
        bincode::serialize(txn).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "transaction too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Txn][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - One entry holds every event of one transaction, audit record included, so a
///   transaction replays whole or not at all.
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`. Anything past it
    /// belongs to a batch nobody was told succeeded.
    synced_len: u64,
    unsynced_appends: u64,
    /// Set while a rollback is incomplete; appends are refused until one succeeds.
    needs_rollback: bool,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            synced_len,
            unsynced_appends: 0,
            needs_rollback: false,
        })
    }

    /// Append and fsync. Production code batches through `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, txn: &Txn) -> io::Result<()> {
        self.append_buffered(txn)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, txn: &Txn) -> io::Result<()> {
        if self.needs_rollback {
            return Err(io::Error::other("WAL tail not yet rolled back after a failed batch"));
        }
        encode_txn(&mut self.writer, txn)?;
        self.appends_since_compact += 1;
        self.unsynced_appends += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Throw away everything written since the last successful `flush_sync`:
    /// buffered bytes are dropped unwritten and the file is truncated back, so
    /// a failed batch leaves neither whole nor torn entries behind.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.needs_rollback = true;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the file without flushing the buffer.
        let (old_file, _unwritten) = old.into_parts();
        drop(old_file);

        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.unsynced_appends);
        self.unsynced_appends = 0;
        self.needs_rollback = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file and fsync. Slow phase, no swap yet.
    pub fn write_compact_file(path: &Path, snapshot: &[Txn]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for txn in snapshot {
            encode_txn(&mut writer, txn)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced_appends = 0;
        self.needs_rollback = false;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, snapshot: &[Txn]) -> io::Result<()> {
        Self::write_compact_file(&self.path, snapshot)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all intact transactions.
    /// Truncated/corrupt trailing entries are discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Txn>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut txns = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!(path = %path.display(), "WAL: discarding corrupt trailing entry");
                break;
            }

            match bincode::deserialize::<Txn>(&payload) {
                Ok(txn) => txns.push(txn),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(txns)
    }
}
