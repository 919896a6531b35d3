//! I/O utilities.
//!
//! This module reads document manifests (JSONL or CSV, detected from the file
//! name or the first byte of input) and writes exported text to a file or to
//! standard output.

use std::{pin::Pin, sync::Arc, task::Context};

use futures::{StreamExt as _, TryStreamExt as _};
use peekable::tokio::AsyncPeekable;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::{
    fs::File,
    io::{
        AsyncBufRead, AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _,
        BufReader, ReadBuf,
    },
};
use tokio_stream::wrappers::LinesStream;

use crate::prelude::*;

use super::BoxedStream;

/// A smart async reader that uses [`AsyncPeekable`] to detect whether the
/// input is JSONL or CSV.
pub struct SmartReader {
    /// Do we expect our input to be JSONL?
    is_json_like: bool,

    /// A human-readable description of the input source, for error messages.
    description: String,

    /// Our reader. It's pinned because async reads may hold pointers into it.
    reader: Pin<Box<dyn AsyncBufRead + Unpin + Send + Sync + 'static>>,
}

impl SmartReader {
    /// Create a new `SmartReader` from an existing reader, peeking at the
    /// first byte to guess the format.
    pub async fn new_from_reader(
        description: String,
        reader: impl AsyncRead + Unpin + Send + Sync + 'static,
    ) -> Result<Self> {
        let reader = BufReader::new(reader);
        let mut peekable = AsyncPeekable::new(Box::new(reader));
        let mut buffer = vec![0; 1];
        peekable
            .peek_exact(&mut buffer)
            .await
            .with_context(|| format!("{description} is empty"))?;
        let is_json_like = buffer[0] == b'{';
        Ok(Self {
            is_json_like,
            description,
            reader: Box::pin(BufReader::new(peekable)),
        })
    }

    /// Create a new `SmartReader` from a [`Path`], using the extension to
    /// pick a format. `-` means standard input.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Self::new_from_reader("stdin".to_owned(), tokio::io::stdin()).await;
        }
        let ext = path.extension().unwrap_or_default();
        let is_json_like = ext == "json" || ext == "jsonl";
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open file at path: {:?}", path))?;
        Ok(Self {
            is_json_like,
            description: path.to_string_lossy().into_owned(),
            reader: Box::pin(BufReader::new(file)),
        })
    }
}

impl AsyncRead for SmartReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        Pin::get_mut(self).reader.as_mut().poll_read(cx, buf)
    }
}

impl AsyncBufRead for SmartReader {
    fn poll_fill_buf(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> std::task::Poll<std::io::Result<&[u8]>> {
        Pin::get_mut(self).reader.as_mut().poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::get_mut(self).reader.as_mut().consume(amt)
    }
}

/// Read JSONL or CSV records as JSON objects.
///
/// CSV cells are always strings. Empty CSV cells are dropped, so optional
/// fields can simply be left blank.
pub async fn read_jsonl_or_csv(path: &Path) -> Result<BoxedStream<Result<Value>>> {
    let reader = SmartReader::new_from_path(path).await?;
    let description = Arc::new(reader.description.clone());
    if reader.is_json_like {
        let lines = LinesStream::new(reader.lines());
        Ok(lines
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .map(move |line| {
                let line = line?;
                serde_json::from_str::<Value>(&line).with_context(|| {
                    format!("Failed to parse JSON from line in {:?}: {:?}", description, line)
                })
            })
            .boxed())
    } else {
        let mut reader = csv_async::AsyncReaderBuilder::new().create_reader(reader);
        let headers = Arc::new(
            reader
                .headers()
                .await
                .with_context(|| format!("Failed to read CSV headers from {:?}", description))?
                .to_owned(),
        );
        Ok(reader
            .into_records()
            .map(move |record| {
                let record = record.with_context(|| {
                    format!("Failed to read CSV record from {:?}", description)
                })?;
                let map: Map<String, Value> = headers
                    .iter()
                    .zip(record.iter())
                    .filter(|(_, value)| !value.is_empty())
                    .map(|(header, value)| (header.to_owned(), Value::String(value.to_owned())))
                    .collect();
                Ok(Value::Object(map))
            })
            .boxed())
    }
}

/// Read every record of a JSONL or CSV file into typed values.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn read_records<T>(path: &Path) -> Result<Vec<T>>
where
    T: DeserializeOwned,
{
    read_jsonl_or_csv(path)
        .await?
        .enumerate()
        .map(|(idx, value)| {
            serde_json::from_value::<T>(value?)
                .with_context(|| format!("invalid record {} in {:?}", idx + 1, path.display()))
        })
        .try_collect()
        .await
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write text to either standard output or a file.
pub async fn write_text_output(path: Option<&Path>, text: &str) -> Result<()> {
    let mut writer = create_writer(path).await?;
    writer
        .write_all(text.as_bytes())
        .await
        .context("Failed to write output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::pages::DocumentInput;

    use super::*;

    #[tokio::test]
    async fn reads_csv_manifest() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("manifest")?;
        let path = dir.path().join("docs.csv");
        tokio::fs::write(&path, "path,source_id\na.pdf,Sheet A\nb.png,\n").await?;
        let docs = read_records::<DocumentInput>(&path).await?;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].source_id(), "Sheet A");
        assert_eq!(docs[1].source_id(), "b.png");
        Ok(())
    }

    #[tokio::test]
    async fn reads_jsonl_manifest() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("manifest")?;
        let path = dir.path().join("docs.jsonl");
        tokio::fs::write(
            &path,
            "{\"path\": \"a.pdf\"}\n\n{\"path\": \"b.pdf\", \"password\": \"x\"}\n",
        )
        .await?;
        let docs = read_records::<DocumentInput>(&path).await?;
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].password.as_deref(), Some("x"));
        Ok(())
    }

    #[tokio::test]
    async fn rejects_unknown_manifest_columns() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("manifest")?;
        let path = dir.path().join("docs.csv");
        tokio::fs::write(&path, "path,colour\na.pdf,red\n").await?;
        assert!(read_records::<DocumentInput>(&path).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn writes_text_to_file() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("output")?;
        let path = dir.path().join("out.csv");
        write_text_output(Some(&path), "a,b\n").await?;
        assert_eq!(tokio::fs::read_to_string(&path).await?, "a,b\n");
        Ok(())
    }
}
