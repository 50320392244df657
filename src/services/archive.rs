//! src/services/archive.rs
//!
//! Streaming ZIP assembly. [`ArchiveStream`] turns an ordered list of
//! [`ArchiveEntry`] values into a lazily produced sequence of byte chunks that
//! concatenate to a complete ZIP archive.
//!
//! Records are written by [`zip::ZipWriter`] in streaming mode (CRC and sizes
//! follow each entry in a data descriptor) into a shared buffer that is
//! drained after every step. Only the chunk in flight and the writer's
//! central directory bookkeeping stay in memory.
//!
//! The stream is pull-based: a chunk is produced only when the consumer polls,
//! and at most one source file is open at a time. Dropping the stream closes
//! that file.

use crate::services::content_store::ContentStore;
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use futures::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use std::{
    io::{self, Write},
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use zip::{
    CompressionMethod, ZipWriter,
    result::ZipError,
    write::{SimpleFileOptions, StreamWriter},
};

/// Default read size for source files.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Largest size or offset the classic (non-ZIP64) format can record.
const CLASSIC_LIMIT: u64 = u32::MAX as u64;
const MAX_ENTRIES: usize = u16::MAX as usize;
const FILE_PERMISSIONS: u32 = 0o644;

/// Where the bytes of an entry come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntrySource {
    /// Path relative to the content-store root, read in chunks.
    Stored(String),

    /// Bytes already in memory, written in one step.
    Inline(Bytes),
}

/// One item to place in the archive.
///
/// Destinations must be unique within one archive. A repeated destination
/// ends the stream with [`ArchiveError::Zip`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: EntrySource,

    /// Path inside the archive, `/`-separated.
    pub destination: String,
}

impl ArchiveEntry {
    pub fn stored(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: EntrySource::Stored(source.into()),
            destination: destination.into(),
        }
    }

    pub fn inline(bytes: impl Into<Bytes>, destination: impl Into<String>) -> Self {
        Self {
            source: EntrySource::Inline(bytes.into()),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write archive: {0}")]
    Zip(#[from] ZipError),
    #[error("archive name `{0}` is longer than 65535 bytes")]
    NameTooLong(String),
    #[error("{0} exceeds the classic ZIP limit")]
    Zip64Required(&'static str),
}

/// Tuning knobs for [`ArchiveStream`].
#[derive(Clone, Copy, Debug)]
pub struct ArchiveOptions {
    /// Bytes read from a source file per step.
    pub chunk_size: usize,

    /// Zone used for the DOS timestamps stored in entry headers.
    pub time_zone: Tz,

    pub compression: CompressionMethod,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            time_zone: Tz::UTC,
            compression: CompressionMethod::Deflated,
        }
    }
}

/// A lazily generated ZIP archive.
///
/// Yields `Ok` chunks until the end-of-central-directory record has been
/// emitted. On failure it yields a single `Err` and then ends; the bytes
/// produced so far do not form a valid archive.
pub struct ArchiveStream {
    inner: BoxStream<'static, Result<Bytes, ArchiveError>>,
}

impl ArchiveStream {
    pub fn new(store: ContentStore, entries: Vec<ArchiveEntry>, options: ArchiveOptions) -> Self {
        Self::with_limit(store, entries, options, CLASSIC_LIMIT)
    }

    /// Like [`ArchiveStream::new`], failing once any entry or the archive
    /// itself grows past `limit` bytes.
    fn with_limit(
        store: ContentStore,
        entries: Vec<ArchiveEntry>,
        options: ArchiveOptions,
        limit: u64,
    ) -> Self {
        let sink = SharedBuffer::default();
        let assembler = Assembler {
            store,
            pending: entries.into_iter(),
            current: None,
            writer: Some(ZipWriter::new_stream(sink.clone())),
            sink,
            entries_started: 0,
            offset: 0,
            limit,
            options,
        };

        let inner = stream::try_unfold(assembler, |mut assembler| async move {
            let chunk = assembler.next_chunk().await?;
            Ok::<_, ArchiveError>(chunk.map(|chunk| (chunk, assembler)))
        })
        .boxed();

        Self { inner }
    }
}

impl Stream for ArchiveStream {
    type Item = Result<Bytes, ArchiveError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Write target handed to the zip writer. The assembler drains it after
/// every step.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type ArchiveWriter = ZipWriter<StreamWriter<SharedBuffer>>;

/// The stored entry currently being copied.
struct OpenEntry {
    source: String,
    name: String,
    reader: ReaderStream<File>,
    uncompressed: u64,
}

struct Assembler {
    store: ContentStore,
    pending: std::vec::IntoIter<ArchiveEntry>,
    current: Option<OpenEntry>,
    /// `None` once the central directory has been written.
    writer: Option<ArchiveWriter>,
    sink: SharedBuffer,
    entries_started: usize,
    /// Bytes emitted so far.
    offset: u64,
    limit: u64,
    options: ArchiveOptions,
}

impl Assembler {
    /// Produce the next chunk, or `None` once the archive is finished.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ArchiveError> {
        loop {
            if self.writer.is_none() {
                return Ok(None);
            }

            let Some(open) = self.current.as_mut() else {
                match self.pending.next() {
                    Some(entry) => return self.start_entry(entry).await.map(Some),
                    None => return self.finish_archive().map(Some),
                }
            };

            let next = open.reader.next().await;
            match next {
                Some(Ok(data)) => {
                    open.uncompressed += data.len() as u64;
                    if open.uncompressed > self.limit {
                        return Err(ArchiveError::Zip64Required("entry size"));
                    }

                    let written = match self.writer.as_mut() {
                        Some(writer) => writer.write_all(&data),
                        None => Err(io::Error::other("archive already finished")),
                    };
                    written.map_err(ZipError::Io)?;

                    // The compressor may hold input back until a block fills up.
                    let chunk = self.drain()?;
                    if !chunk.is_empty() {
                        return Ok(Some(chunk));
                    }
                }
                Some(Err(source)) => {
                    return Err(ArchiveError::Io {
                        path: open.source.clone(),
                        source,
                    });
                }
                None => {
                    // The next header or the central directory closes the entry.
                    if let Some(done) = self.current.take() {
                        debug!("archived {} ({} bytes)", done.name, done.uncompressed);
                    }
                }
            }
        }
    }

    /// Begin the next entry and emit its local file header.
    ///
    /// Stored sources are opened and left for [`Assembler::next_chunk`] to
    /// copy; inline bytes are written in full.
    async fn start_entry(&mut self, entry: ArchiveEntry) -> Result<Bytes, ArchiveError> {
        if self.entries_started >= MAX_ENTRIES {
            return Err(ArchiveError::Zip64Required("entry count"));
        }
        if u16::try_from(entry.destination.len()).is_err() {
            return Err(ArchiveError::NameTooLong(entry.destination));
        }

        let ArchiveEntry {
            source,
            destination,
        } = entry;

        match source {
            EntrySource::Stored(path) => {
                let file = match self.store.open(&path).await {
                    Ok(file) => file,
                    Err(source) => return Err(ArchiveError::Io { path, source }),
                };
                let modified = file
                    .metadata()
                    .await
                    .and_then(|meta| meta.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                self.start_file(&destination, modified)?;
                debug!(
                    "archiving {} as {} at offset {}",
                    path, destination, self.offset
                );

                self.current = Some(OpenEntry {
                    source: path,
                    name: destination,
                    reader: ReaderStream::with_capacity(file, self.options.chunk_size.max(1)),
                    uncompressed: 0,
                });
            }
            EntrySource::Inline(bytes) => {
                if bytes.len() as u64 > self.limit {
                    return Err(ArchiveError::Zip64Required("entry size"));
                }

                self.start_file(&destination, Utc::now())?;
                self.writer()?.write_all(&bytes).map_err(ZipError::Io)?;
                debug!(
                    "archived {} in-memory bytes as {} at offset {}",
                    bytes.len(),
                    destination,
                    self.offset
                );
            }
        }

        self.entries_started += 1;
        self.drain()
    }

    fn start_file(&mut self, name: &str, modified: DateTime<Utc>) -> Result<(), ArchiveError> {
        let options = SimpleFileOptions::default()
            .compression_method(self.options.compression)
            .last_modified_time(dos_datetime(modified, self.options.time_zone))
            .unix_permissions(FILE_PERMISSIONS);
        self.writer()?.start_file(name, options)?;
        Ok(())
    }

    /// Close the last entry and emit the central directory.
    fn finish_archive(&mut self) -> Result<Bytes, ArchiveError> {
        let writer = self.writer.take().ok_or(ZipError::Io(finished()))?;
        writer.finish()?;

        let chunk = self.drain()?;
        info!(
            "archive complete: {} entries, {} bytes",
            self.entries_started, self.offset
        );
        Ok(chunk)
    }

    fn writer(&mut self) -> Result<&mut ArchiveWriter, ZipError> {
        self.writer.as_mut().ok_or(ZipError::Io(finished()))
    }

    /// Hand out whatever the writer produced since the last call.
    fn drain(&mut self) -> Result<Bytes, ArchiveError> {
        let bytes = self.sink.take();
        self.offset += bytes.len() as u64;
        if self.offset > self.limit {
            return Err(ArchiveError::Zip64Required("archive size"));
        }
        Ok(Bytes::from(bytes))
    }
}

impl Drop for Assembler {
    fn drop(&mut self) {
        if self.writer.is_some() {
            debug!(
                "archive stream closed early after {} bytes ({} entries started)",
                self.offset, self.entries_started
            );
        }
    }
}

fn finished() -> io::Error {
    io::Error::other("archive already finished")
}

/// Entry timestamp for `at` in zone `tz`.
///
/// DOS dates cover 1980..=2107; anything outside is clamped to the nearest end.
fn dos_datetime(at: DateTime<Utc>, tz: Tz) -> zip::DateTime {
    let local = at.with_timezone(&tz).naive_local();
    zip::DateTime::try_from(local).unwrap_or_else(|_| {
        if local.year() < 1980 {
            zip::DateTime::default()
        } else {
            zip::DateTime::from_date_and_time(2107, 12, 31, 23, 59, 58).unwrap_or_default()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use std::{
        io::{Cursor, Read},
        path::{Path, PathBuf},
    };
    use tempfile::TempDir;

    async fn store_with(files: &[(&str, &[u8])]) -> (TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        for (path, bytes) in files {
            store.write_atomic(path, bytes).await.unwrap();
        }
        (dir, store)
    }

    async fn collect(stream: ArchiveStream) -> Vec<Bytes> {
        stream.try_collect().await.unwrap()
    }

    fn read_entry(archive: &mut zip::ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
        let mut entry = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    /// Incompressible payload, so compressed output tracks input.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u32 = 0x9e37_79b9;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    /// Whether this process holds a descriptor for `path`.
    #[cfg(target_os = "linux")]
    fn is_open(path: &Path) -> bool {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|fd| std::fs::read_link(fd.path()).ok())
            .any(|link: PathBuf| link == target)
    }

    #[tokio::test]
    async fn archive_round_trips_in_order() {
        let (_dir, store) = store_with(&[
            ("uploads/7/b.txt", b"bravo bravo bravo".as_slice()),
            ("uploads/7/a.txt", b"alpha".as_slice()),
            ("uploads/7/empty.bin", b"".as_slice()),
        ])
        .await;
        let entries = vec![
            ArchiveEntry::stored("uploads/7/b.txt", "7/b.txt"),
            ArchiveEntry::stored("uploads/7/a.txt", "7/a.txt"),
            ArchiveEntry::stored("uploads/7/empty.bin", "7/empty.bin"),
            ArchiveEntry::inline(Bytes::from_static(b"generated"), "notes.txt"),
        ];

        let chunks = collect(ArchiveStream::new(store, entries, ArchiveOptions::default())).await;
        let bytes: Vec<u8> = chunks.concat();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();

        assert_eq!(archive.len(), 4);
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["7/b.txt", "7/a.txt", "7/empty.bin", "notes.txt"]);

        assert_eq!(read_entry(&mut archive, "7/b.txt"), b"bravo bravo bravo");
        assert_eq!(read_entry(&mut archive, "7/a.txt"), b"alpha");
        assert!(read_entry(&mut archive, "7/empty.bin").is_empty());
        assert_eq!(read_entry(&mut archive, "notes.txt"), b"generated");

        let entry = archive.by_name("7/a.txt").unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Deflated);
        assert_eq!(entry.unix_mode().map(|mode| mode & 0o777), Some(0o644));
    }

    #[tokio::test]
    async fn empty_entry_list_is_still_a_valid_archive() {
        let (_dir, store) = store_with(&[]).await;
        let chunks = collect(ArchiveStream::new(store, Vec::new(), ArchiveOptions::default())).await;
        let archive = zip::ZipArchive::new(Cursor::new(chunks.concat())).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[tokio::test]
    async fn large_file_is_streamed_in_bounded_chunks() {
        let payload = noise(2 * 1024 * 1024);
        let (_dir, store) = store_with(&[("uploads/1/big.bin", payload.as_slice())]).await;

        let options = ArchiveOptions {
            chunk_size: 4 * 1024,
            ..ArchiveOptions::default()
        };
        let chunks = collect(ArchiveStream::new(
            store,
            vec![ArchiveEntry::stored("uploads/1/big.bin", "1/big.bin")],
            options,
        ))
        .await;

        let largest = chunks.iter().map(Bytes::len).max().unwrap();
        assert!(chunks.len() >= 16, "only {} chunks", chunks.len());
        assert!(largest <= 256 * 1024, "chunk of {} bytes", largest);

        let mut archive = zip::ZipArchive::new(Cursor::new(chunks.concat())).unwrap();
        assert_eq!(read_entry(&mut archive, "1/big.bin"), payload);
    }

    #[tokio::test]
    async fn missing_source_ends_stream_with_io_error() {
        let (_dir, store) = store_with(&[("uploads/2/ok.txt", b"fine".as_slice())]).await;
        let entries = vec![
            ArchiveEntry::stored("uploads/2/ok.txt", "2/ok.txt"),
            ArchiveEntry::stored("uploads/2/gone.txt", "2/gone.txt"),
        ];
        let mut stream = ArchiveStream::new(store, entries, ArchiveOptions::default());

        let mut produced = 0;
        let err = loop {
            match stream.next().await {
                Some(Ok(_)) => produced += 1,
                Some(Err(err)) => break err,
                None => panic!("stream finished without error"),
            }
        };

        assert!(produced > 0);
        match err {
            ArchiveError::Io { path, source } => {
                assert_eq!(path, "uploads/2/gone.txt");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_destination_is_rejected() {
        let (_dir, store) = store_with(&[("uploads/4/a.txt", b"a".as_slice())]).await;
        let entries = vec![
            ArchiveEntry::stored("uploads/4/a.txt", "4/a.txt"),
            ArchiveEntry::stored("uploads/4/a.txt", "4/a.txt"),
        ];
        let result: Result<Vec<Bytes>, _> =
            ArchiveStream::new(store, entries, ArchiveOptions::default())
                .try_collect()
                .await;
        assert!(matches!(result, Err(ArchiveError::Zip(_))));
    }

    #[tokio::test]
    async fn oversized_entry_fails_before_it_is_fully_sent() {
        let payload = noise(1024 * 1024);
        let (_dir, store) = store_with(&[("uploads/5/big.bin", payload.as_slice())]).await;
        let options = ArchiveOptions {
            chunk_size: 4 * 1024,
            ..ArchiveOptions::default()
        };
        let mut stream = ArchiveStream::with_limit(
            store,
            vec![ArchiveEntry::stored("uploads/5/big.bin", "5/big.bin")],
            options,
            64 * 1024,
        );

        let mut sent = 0;
        let err = loop {
            match stream.next().await {
                Some(Ok(chunk)) => sent += chunk.len(),
                Some(Err(err)) => break err,
                None => panic!("stream finished without error"),
            }
        };

        assert!(matches!(err, ArchiveError::Zip64Required(_)), "{err:?}");
        assert!(sent <= 128 * 1024, "sent {} bytes first", sent);
        assert!(stream.next().await.is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn source_file_is_released_on_drop() {
        let (dir, store) = store_with(&[("uploads/3/a.bin", noise(256 * 1024).as_slice())]).await;
        let path = dir.path().join("uploads/3/a.bin");
        let options = ArchiveOptions {
            chunk_size: 4 * 1024,
            ..ArchiveOptions::default()
        };
        let mut stream = ArchiveStream::new(
            store,
            vec![ArchiveEntry::stored("uploads/3/a.bin", "3/a.bin")],
            options,
        );

        let header = stream.next().await.unwrap().unwrap();
        assert_eq!(&header[..4], b"PK\x03\x04");
        stream.next().await.unwrap().unwrap();
        assert!(is_open(&path));

        drop(stream);
        assert!(!is_open(&path));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn source_files_are_released_on_error_and_completion() {
        let (dir, store) = store_with(&[
            ("uploads/6/a.txt", b"first".as_slice()),
            ("uploads/6/b.txt", b"second".as_slice()),
        ])
        .await;
        let a = dir.path().join("uploads/6/a.txt");
        let b = dir.path().join("uploads/6/b.txt");

        let failing = ArchiveStream::new(
            store.clone(),
            vec![
                ArchiveEntry::stored("uploads/6/a.txt", "6/a.txt"),
                ArchiveEntry::stored("uploads/6/gone.txt", "6/gone.txt"),
            ],
            ArchiveOptions::default(),
        );
        let result: Result<Vec<Bytes>, _> = failing.try_collect().await;
        assert!(matches!(result, Err(ArchiveError::Io { .. })));
        assert!(!is_open(&a));

        let complete = ArchiveStream::new(
            store,
            vec![
                ArchiveEntry::stored("uploads/6/a.txt", "6/a.txt"),
                ArchiveEntry::stored("uploads/6/b.txt", "6/b.txt"),
            ],
            ArchiveOptions::default(),
        );
        collect(complete).await;
        assert!(!is_open(&a));
        assert!(!is_open(&b));
    }

    #[test]
    fn dos_datetime_uses_configured_zone() {
        let at = Utc.with_ymd_and_hms(2023, 8, 12, 15, 30, 10).unwrap();
        let utc = dos_datetime(at, Tz::UTC);
        assert_eq!(
            (utc.year(), utc.month(), utc.day(), utc.hour(), utc.minute(), utc.second()),
            (2023, 8, 12, 15, 30, 10)
        );

        assert_eq!(dos_datetime(at, chrono_tz::America::New_York).hour(), 11);

        let early = dos_datetime(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap(), Tz::UTC);
        assert_eq!(early, zip::DateTime::default());
    }
}
