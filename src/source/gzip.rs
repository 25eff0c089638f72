//! gzip framing for `.gz` sources and outputs.

use bytes::BytesMut;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

const READ_CHUNK: usize = 64 * 1024;

/// Paths ending in `.gz` are read and written gzipped.
pub fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Plain bytes of one file, inflated on the fly for `.gz` paths.
pub(crate) struct ChunkReader {
    file: File,
    inflate: Option<GzDecoder<Vec<u8>>>,
    chunk: Vec<u8>,
}

impl ChunkReader {
    pub(crate) async fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            file,
            inflate: is_gzip(path).then(|| GzDecoder::new(Vec::new())),
            chunk: vec![0; READ_CHUNK],
        })
    }

    /// Append the next plain bytes to `buf`; `false` once the file is exhausted.
    pub(crate) async fn fill(&mut self, buf: &mut BytesMut) -> io::Result<bool> {
        loop {
            let n = self.file.read(&mut self.chunk).await?;
            let Some(inflate) = self.inflate.as_mut() else {
                buf.extend_from_slice(&self.chunk[..n]);
                return Ok(n > 0);
            };

            if n == 0 {
                inflate.try_finish()?;
            } else {
                inflate.write_all(&self.chunk[..n])?;
                inflate.flush()?;
            }
            let plain = std::mem::take(inflate.get_mut());
            if !plain.is_empty() {
                buf.extend_from_slice(&plain);
                return Ok(true);
            }
            if n == 0 {
                return Ok(false);
            }
        }
    }
}

/// Newline-delimited output file, gzipped for `.gz` paths.
pub struct LineWriter {
    file: BufWriter<File>,
    deflate: Option<GzEncoder<Vec<u8>>>,
}

impl fmt::Debug for LineWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineWriter")
            .field("gzip", &self.deflate.is_some())
            .finish_non_exhaustive()
    }
}

impl LineWriter {
    pub async fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            file: BufWriter::new(file),
            deflate: is_gzip(path).then(|| GzEncoder::new(Vec::new(), Compression::default())),
        })
    }

    pub async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        match self.deflate.as_mut() {
            None => {
                self.file.write_all(line).await?;
                self.file.write_all(b"\n").await
            }
            Some(deflate) => {
                deflate.write_all(line)?;
                deflate.write_all(b"\n")?;
                let compressed = std::mem::take(deflate.get_mut());
                self.file.write_all(&compressed).await
            }
        }
    }

    /// Write the gzip trailer, if any, and flush.
    pub async fn finish(mut self) -> io::Result<()> {
        if let Some(deflate) = self.deflate.take() {
            let rest = deflate.finish()?;
            self.file.write_all(&rest).await?;
        }
        self.file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_gzip_by_extension() {
        assert!(is_gzip(Path::new("requests.jsonl.gz")));
        assert!(is_gzip(Path::new("REQUESTS.GZ")));
        assert!(!is_gzip(Path::new("requests.jsonl")));
        assert!(!is_gzip(Path::new("gz")));
    }

    #[tokio::test]
    async fn test_gzip_writer_then_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl.gz");

        let mut writer = LineWriter::create(&path).await.unwrap();
        for i in 0..1000 {
            writer
                .write_line(format!("{{\"n\":{}}}", i).as_bytes())
                .await
                .unwrap();
        }
        writer.finish().await.unwrap();

        let mut plain = String::new();
        flate2::read::GzDecoder::new(std::fs::File::open(&path).unwrap())
            .read_to_string(&mut plain)
            .unwrap();
        assert_eq!(plain.lines().count(), 1000);
        assert_eq!(plain.lines().last(), Some("{\"n\":999}"));

        let mut reader = ChunkReader::open(&path).await.unwrap();
        let mut buf = BytesMut::new();
        while reader.fill(&mut buf).await.unwrap() {}
        assert_eq!(buf.as_ref(), plain.as_bytes());
    }
}
