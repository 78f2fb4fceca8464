//! Append-only binary write log and its recovery reader.
//!
//! One record per mutating command, little-endian length-prefixed fields
//! followed by a fixed terminator. The format carries no TTL field, so keys
//! restored from the log come back without expiry; it also carries no
//! version byte, so the layout must not change silently.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, OnceCell};

use crate::utils::config::geomys_dir;
use crate::utils::GeomysError;

/// 4-byte record terminator: `"EOF\0"`.
const RECORD_TERMINATOR: [u8; 4] = [0x45, 0x4F, 0x46, 0x00];

/// A mutating command captured in the write log. Non-mutating commands are
/// never logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub command: String,
    pub key: String,
    pub value: Option<String>,
    /// INCR delta as an ASCII decimal string.
    pub offset: Option<String>,
}

/// The append-only write log over one backer file. Appends are serialized
/// by the file mutex; the file cursor is kept at EOF between operations.
#[derive(Debug)]
pub struct Binlog {
    path: PathBuf,
    file: Mutex<File>,
}

/// Process-wide lazily-initialized instance backed by the default path.
static SHARED: OnceCell<std::sync::Arc<Binlog>> = OnceCell::const_new();

impl Binlog {
    /// Opens (creating if needed) the backer file at `path`.
    pub async fn new(path: &Path) -> Result<Self, GeomysError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| {
                GeomysError::Fatal(format!(
                    "cannot open binlog '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        file.seek(SeekFrom::End(0)).await?;

        Ok(Binlog {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Returns the process-wide instance at `<home>/.geomys/binlog.dat`,
    /// initializing it on first use.
    pub async fn shared() -> Result<std::sync::Arc<Binlog>, GeomysError> {
        SHARED
            .get_or_try_init(|| async {
                let path = geomys_dir()?.join("binlog.dat");
                Ok(std::sync::Arc::new(Binlog::new(&path).await?))
            })
            .await
            .cloned()
    }

    /// Appends one record to the log.
    pub async fn append(
        &self,
        req: &LoggedRequest,
    ) -> Result<(), GeomysError> {
        let bytes = Self::encode_record(req);
        let mut file = self.file.lock().await;
        file.write_all(&bytes[..]).await?;
        file.flush().await?;
        Ok(())
    }

    /// Reads all records back in append order. A truncated or corrupt tail
    /// ends the scan at the last whole record.
    pub async fn load_all(&self) -> Result<Vec<LoggedRequest>, GeomysError> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(0)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        file.seek(SeekFrom::End(0)).await?; // recover cursor to EOF

        let (records, clean) = Self::parse_records(&bytes);
        if !clean {
            pf_warn!(
                "binlog";
                "discarding corrupt tail after {} whole records",
                records.len()
            );
        }
        Ok(records)
    }

    /// Empties the log. The held handle is replaced by a freshly-opened
    /// truncating one (platforms may disallow truncating a held writable
    /// handle).
    pub async fn clear(&self) -> Result<(), GeomysError> {
        let mut file = self.file.lock().await;
        let truncated = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        *file = truncated;
        Ok(())
    }

    /// Encodes one record: four little-endian u32-length-prefixed fields
    /// (zero length marks an absent optional field) plus the terminator.
    fn encode_record(req: &LoggedRequest) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            20 + req.command.len() + req.key.len(),
        );
        for field in [
            Some(req.command.as_str()),
            Some(req.key.as_str()),
            req.value.as_deref(),
            req.offset.as_deref(),
        ] {
            match field {
                Some(s) => {
                    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                None => buf.extend_from_slice(&0u32.to_le_bytes()),
            }
        }
        buf.extend_from_slice(&RECORD_TERMINATOR);
        buf
    }

    /// Parses whole records from `bytes`. Returns the records and whether
    /// the scan consumed the input cleanly (false on a truncated or
    /// corrupt tail).
    fn parse_records(bytes: &[u8]) -> (Vec<LoggedRequest>, bool) {
        let mut records = Vec::new();
        let mut at = 0;

        while at < bytes.len() {
            match Self::parse_one(bytes, at) {
                Some((record, next)) => {
                    records.push(record);
                    at = next;
                }
                None => return (records, false),
            }
        }

        (records, true)
    }

    /// Parses one record starting at `at`, returning it and the offset of
    /// the next record. `None` if the slice does not hold a whole valid
    /// record.
    fn parse_one(
        bytes: &[u8],
        mut at: usize,
    ) -> Option<(LoggedRequest, usize)> {
        let command = Self::read_field(bytes, &mut at)??;
        let key = Self::read_field(bytes, &mut at)??;
        let value = Self::read_field(bytes, &mut at)?;
        let offset = Self::read_field(bytes, &mut at)?;

        let term_end = at.checked_add(4)?;
        if term_end > bytes.len() || bytes[at..term_end] != RECORD_TERMINATOR
        {
            return None;
        }

        Some((
            LoggedRequest {
                command,
                key,
                value,
                offset,
            },
            term_end,
        ))
    }

    /// Reads one length-prefixed field at `*at`, advancing it past the
    /// field. Outer `None` means the slice is exhausted or invalid; inner
    /// `None` means the field is present-but-absent (zero length).
    fn read_field(
        bytes: &[u8],
        at: &mut usize,
    ) -> Option<Option<String>> {
        let len_end = at.checked_add(4)?;
        if len_end > bytes.len() {
            return None;
        }
        let len =
            u32::from_le_bytes(bytes[*at..len_end].try_into().unwrap())
                as usize;
        let field_end = len_end.checked_add(len)?;
        if field_end > bytes.len() {
            return None;
        }
        let field = if len == 0 {
            None
        } else {
            Some(String::from_utf8(bytes[len_end..field_end].to_vec()).ok()?)
        };
        *at = field_end;
        Some(field)
    }
}
