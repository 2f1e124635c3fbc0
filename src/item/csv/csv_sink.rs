use std::{
    cell::{Cell, RefCell},
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::Path,
};

use csv::WriterBuilder;
use log::{debug, warn};
use serde::Serialize;

use crate::{
    BatchError,
    core::{
        chunk::Chunk,
        item::{BatchSink, SinkResult},
    },
};

/// A writer that can drop bytes written after a known length.
///
/// [`CsvSink`] uses it to undo a chunk whose write failed halfway, so a
/// retried or resumed chunk never lands after a torn copy of itself.
pub trait CsvDestination: Write {
    /// Length of the data written so far.
    fn written_len(&mut self) -> io::Result<u64>;

    /// Discards everything written after `len`; the next write goes at `len`.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl CsvDestination for File {
    fn written_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

impl CsvDestination for Vec<u8> {
    fn written_len(&mut self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(io::Error::other)?;
        Vec::truncate(self, len);
        Ok(())
    }
}

/// Writes every committed chunk as CSV records.
///
/// A chunk is serialized into a buffer first, then written with a single
/// `write_all` followed by a flush. When the write fails the destination is
/// truncated back to its length before the chunk, so the chunk is either
/// fully written or not at all.
pub struct CsvSink<W: CsvDestination> {
    destination: RefCell<W>,
    delimiter: u8,
    has_headers: bool,
    headers_written: Cell<bool>,
}

impl<W: CsvDestination> CsvSink<W> {
    fn serialize<O: Serialize>(&self, chunk: &Chunk<O>) -> Result<Vec<u8>, BatchError> {
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .flexible(false)
            .has_headers(self.has_headers && !self.headers_written.get())
            .from_writer(Vec::new());

        for item in chunk {
            writer
                .serialize(item)
                .map_err(|error| BatchError::Sink(error.to_string()))?;
        }

        writer
            .into_inner()
            .map_err(|error| BatchError::Sink(error.to_string()))
    }

    /// Consumes the sink and returns its destination.
    pub fn into_inner(self) -> W {
        self.destination.into_inner()
    }
}

impl<W: CsvDestination, O: Serialize> BatchSink<O> for CsvSink<W> {
    fn commit(&self, chunk: &Chunk<O>) -> SinkResult {
        if chunk.is_empty() {
            return Ok(());
        }

        let buffer = self.serialize(chunk)?;

        let mut destination = self.destination.borrow_mut();
        let committed_len = destination
            .written_len()
            .map_err(|error| BatchError::Sink(error.to_string()))?;

        let written = destination
            .write_all(&buffer)
            .and_then(|()| destination.flush());

        if let Err(error) = written {
            warn!(
                "CSV write failed, truncating destination back to {} bytes",
                committed_len
            );
            return match destination.truncate(committed_len) {
                Ok(()) => Err(BatchError::Sink(error.to_string())),
                Err(rollback) => Err(BatchError::Sink(format!(
                    "{} (rollback failed: {})",
                    error, rollback
                ))),
            };
        }

        self.headers_written.set(true);
        debug!("Wrote {} CSV records ({} bytes)", chunk.len(), buffer.len());
        Ok(())
    }

    fn close(&self) -> Result<(), BatchError> {
        self.destination
            .borrow_mut()
            .flush()
            .map_err(|error| BatchError::Sink(error.to_string()))
    }
}

/// Builder of [`CsvSink`].
///
/// ```
/// use batch_etl_rs::core::{chunk::Chunk, item::BatchSink};
/// use batch_etl_rs::item::csv::CsvSinkBuilder;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Account {
///     id: i64,
///     balance: f64,
/// }
///
/// let sink = CsvSinkBuilder::new().has_headers(true).from_writer(Vec::new());
///
/// let mut chunk = Chunk::new(2);
/// chunk.consume(serde_json::json!(1));
/// chunk.add_item(Account { id: 1, balance: 12.5 });
/// sink.commit(&chunk).unwrap();
///
/// let data = String::from_utf8(sink.into_inner()).unwrap();
/// assert_eq!(data, "id,balance\n1,12.5\n");
/// ```
pub struct CsvSinkBuilder {
    delimiter: u8,
    has_headers: bool,
}

impl Default for CsvSinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvSinkBuilder {
    /// Comma separated, without a header row.
    pub fn new() -> Self {
        Self {
            delimiter: b',',
            has_headers: false,
        }
    }

    /// Sets the field delimiter.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Writes a header row before the first committed record.
    pub fn has_headers(mut self, yes: bool) -> Self {
        self.has_headers = yes;
        self
    }

    /// Creates or truncates the file at `path`.
    pub fn from_path<P: AsRef<Path>>(self, path: P) -> Result<CsvSink<File>, BatchError> {
        let file = File::create(path).map_err(|error| BatchError::Configuration(error.to_string()))?;
        Ok(self.from_writer(file))
    }

    /// Appends to the file at `path`, creating it when missing.
    ///
    /// Used when a restarted step must keep the records committed by the
    /// previous execution; headers are only written into an empty file.
    pub fn append_to_path<P: AsRef<Path>>(self, path: P) -> Result<CsvSink<File>, BatchError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|error| BatchError::Configuration(error.to_string()))?;
        let is_empty = file
            .metadata()
            .map_err(|error| BatchError::Configuration(error.to_string()))?
            .len()
            == 0;

        let sink = self.from_writer(file);
        sink.headers_written.set(!is_empty);
        Ok(sink)
    }

    /// Writes into any [`CsvDestination`], such as a `Vec<u8>`.
    pub fn from_writer<W: CsvDestination>(self, destination: W) -> CsvSink<W> {
        CsvSink {
            destination: RefCell::new(destination),
            delimiter: self.delimiter,
            has_headers: self.has_headers,
            headers_written: Cell::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io};

    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct Row<'a> {
        city: &'a str,
        #[serde(rename = "popcount")]
        population: u64,
    }

    fn chunk_of<'a>(rows: Vec<Row<'a>>) -> Chunk<Row<'a>> {
        let mut chunk = Chunk::new(rows.len().max(1));
        for (index, row) in rows.into_iter().enumerate() {
            chunk.consume(json!(index));
            chunk.add_item(row);
        }
        chunk
    }

    #[test]
    fn headers_are_written_once() -> Result<(), BatchError> {
        let sink = CsvSinkBuilder::new()
            .has_headers(true)
            .delimiter(b';')
            .from_writer(Vec::new());

        sink.commit(&chunk_of(vec![Row {
            city: "Boston",
            population: 4628910,
        }]))?;
        sink.commit(&chunk_of(vec![Row {
            city: "Concord",
            population: 42695,
        }]))?;

        let data = String::from_utf8(sink.into_inner()).map_err(|e| BatchError::Sink(e.to_string()))?;
        assert_eq!(data, "city;popcount\nBoston;4628910\nConcord;42695\n");
        Ok(())
    }

    #[test]
    fn empty_chunk_writes_nothing() -> Result<(), BatchError> {
        let sink = CsvSinkBuilder::new().has_headers(true).from_writer(Vec::new());

        sink.commit(&chunk_of(Vec::new()))?;

        assert!(sink.into_inner().is_empty());
        Ok(())
    }

    /// Accepts `accepted` bytes, then fails once.
    struct TornWriter {
        data: Vec<u8>,
        accepted: usize,
        failed: bool,
    }

    impl Write for TornWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.failed {
                if self.accepted == 0 {
                    self.failed = true;
                    return Err(io::Error::other("device unplugged"));
                }
                let n = buf.len().min(self.accepted);
                self.accepted -= n;
                self.data.extend_from_slice(&buf[..n]);
                return Ok(n);
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CsvDestination for TornWriter {
        fn written_len(&mut self) -> io::Result<u64> {
            self.data.written_len()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            CsvDestination::truncate(&mut self.data, len)
        }
    }

    #[test]
    fn torn_write_is_truncated_before_retry() -> Result<(), BatchError> {
        let sink = CsvSinkBuilder::new().has_headers(true).from_writer(TornWriter {
            data: Vec::new(),
            accepted: 20,
            failed: false,
        });
        let rows = || {
            chunk_of(vec![
                Row {
                    city: "Boston",
                    population: 1,
                },
                Row {
                    city: "Concord",
                    population: 2,
                },
            ])
        };

        let result = sink.commit(&rows());
        assert!(matches!(result, Err(BatchError::Sink(_))));

        sink.commit(&rows())?;

        let data = String::from_utf8(sink.into_inner().data)
            .map_err(|e| BatchError::Sink(e.to_string()))?;
        assert_eq!(data, "city,popcount\nBoston,1\nConcord,2\n");
        Ok(())
    }

    #[test]
    fn file_is_truncated_to_its_committed_length() -> Result<(), BatchError> {
        let dir = tempfile::tempdir().map_err(|e| BatchError::Sink(e.to_string()))?;
        let path = dir.path().join("cities.csv");
        let sink = CsvSinkBuilder::new().append_to_path(&path)?;
        sink.commit(&chunk_of(vec![Row {
            city: "Boston",
            population: 1,
        }]))?;

        let mut file = sink.into_inner();
        file.write_all(b"Conc")
            .and_then(|()| file.truncate(9))
            .and_then(|()| file.write_all(b"Concord,2\n"))
            .map_err(|e| BatchError::Sink(e.to_string()))?;
        drop(file);

        let data = fs::read_to_string(&path).map_err(|e| BatchError::Sink(e.to_string()))?;
        assert_eq!(data, "Boston,1\nConcord,2\n");
        Ok(())
    }

    #[test]
    fn appending_keeps_existing_records() -> Result<(), BatchError> {
        let dir = tempfile::tempdir().map_err(|e| BatchError::Sink(e.to_string()))?;
        let path = dir.path().join("cities.csv");

        let first = CsvSinkBuilder::new().has_headers(true).append_to_path(&path)?;
        first.commit(&chunk_of(vec![Row {
            city: "Boston",
            population: 1,
        }]))?;
        drop(first);

        let second = CsvSinkBuilder::new().has_headers(true).append_to_path(&path)?;
        second.commit(&chunk_of(vec![Row {
            city: "Concord",
            population: 2,
        }]))?;
        BatchSink::<Row>::close(&second)?;

        let data = fs::read_to_string(&path).map_err(|e| BatchError::Sink(e.to_string()))?;
        assert_eq!(data, "city,popcount\nBoston,1\nConcord,2\n");
        Ok(())
    }
}
