use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::source::{EventDecoder, EventSource};

/// Reads one JSON event per line.
pub struct LineSource<R> {
    lines: Lines<R>,
    decoder: EventDecoder,
    line_number: usize,
}

impl LineSource<BufReader<File>> {
    /// Opens a local JSON-lines file.
    pub async fn open(path: impl AsRef<Path>, decoder: EventDecoder) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|e| Error::Source(format!("opening {}: {e}", path.display())))?;
        Ok(LineSource::new(BufReader::new(file), decoder))
    }
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, decoder: EventDecoder) -> Self {
        LineSource {
            lines: reader.lines(),
            decoder,
            line_number: 0,
        }
    }
}

impl<R> EventSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next(&mut self) -> Result<Option<Event>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            if let Some(event) = self.decoder.decode(self.line_number, &line)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_reads_file_line_by_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"dropoff_datetime": "2015-01-01 00:00:01", "fare": 1}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"dropoff_datetime": "2015-01-01 00:00:02", "fare": 2}}"#).unwrap();

        let mut source = LineSource::open(file.path(), EventDecoder::new("dropoff_datetime"))
            .await
            .unwrap();
        let first = source.next().await.unwrap().unwrap();
        let second = source.next().await.unwrap().unwrap();
        assert_eq!(second.timestamp - first.timestamp, 1_000);
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert!(source.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_reports_physical_line() {
        let input: &[u8] = b"{\"ts\": 1}\n\n{\"ts\": \"soon\"}\n";
        let mut source = LineSource::new(input, EventDecoder::new("ts"));
        assert!(source.next().await.unwrap().is_some());
        let err = source.next().await.unwrap_err();
        assert!(err.to_string().contains("line 3"), "{err}");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = LineSource::open(dir.path().join("missing.json"), EventDecoder::new("ts")).await;
        assert!(matches!(result, Err(Error::Source(_))));
    }
}
