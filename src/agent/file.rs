//! File mode: one request per input line, one response per output line.
//!
//! Either side may be gzipped; `.gz` paths are inflated on read and
//! deflated on write.

use futures::StreamExt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::invoke::Invoke;
use crate::source::{read_lines, LineWriter};
use crate::stats::StatsHandle;
use crate::types::{CorrelationId, Error, Result};

/// Invoke every line of `input` serially and write the responses to `output`.
///
/// Stops at the first failure. Returns the number of lines processed.
pub async fn process_file(
    input: &Path,
    output: &Path,
    invoker: &dyn Invoke,
    stats: &StatsHandle,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut writer = LineWriter::create(output).await.map_err(|e| {
        Error::config(format!("failed creating output {}: {}", output.display(), e))
    })?;
    let mut lines = read_lines(input, false, cancel.clone());
    let mut count = 0u64;

    while let Some(line) = lines.next().await {
        let request = line?;
        count += 1;
        let id = CorrelationId::new(format!("line-{}", count));

        stats.start_task(id.clone());
        let response = match invoker.invoke(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                stats.cancel_task(id);
                return Err(e);
            }
        };

        writer.write_line(&response).await?;
        stats.done_task(id, (request.len() + response.len()) as u64);
    }
    writer.finish().await?;

    if cancel.is_cancelled() {
        return Err(Error::cancelled(format!(
            "stopped after {} lines of {}",
            count,
            input.display()
        )));
    }

    tracing::info!(lines = count, output = %output.display(), "file processed");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::super::testing::UppercaseInvoker;
    use super::*;
    use crate::stats::StatsService;
    use crate::types::StatsConfig;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_one_response_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jsonl");
        let output = dir.path().join("out.jsonl");
        std::fs::write(&input, "abc\ndef\n").unwrap();

        let cancel = CancellationToken::new();
        let (stats, mut reports) =
            StatsService::spawn_with_reports(&StatsConfig::default(), cancel.clone());
        let count = process_file(
            &input,
            &output,
            &UppercaseInvoker::default(),
            &stats.handle(),
            cancel,
        )
        .await
        .unwrap();
        stats.stop().await;

        assert_eq!(count, 2);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "ABC\nDEF\n");

        let mut ops = 0;
        while let Some(report) = reports.recv().await {
            ops += report.ops;
        }
        assert_eq!(ops, 2);
    }

    #[tokio::test]
    async fn test_gzipped_input_and_output() {
        use std::io::{Read, Write};

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jsonl.gz");
        let output = dir.path().join("out.jsonl.gz");
        let mut encoder = flate2::write::GzEncoder::new(
            std::fs::File::create(&input).unwrap(),
            flate2::Compression::default(),
        );
        encoder.write_all(b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        encoder.finish().unwrap();

        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&StatsConfig::default(), cancel.clone());
        let count = process_file(
            &input,
            &output,
            &UppercaseInvoker::default(),
            &stats.handle(),
            cancel,
        )
        .await
        .unwrap();
        stats.stop().await;

        let mut written = String::new();
        flate2::read::GzDecoder::new(std::fs::File::open(&output).unwrap())
            .read_to_string(&mut written)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(written, "{\"A\":1}\n{\"B\":2}\n");
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.jsonl");
        let output = dir.path().join("out.jsonl");
        std::fs::write(&input, "ok\nbad\nnever\n").unwrap();

        let invoker = UppercaseInvoker {
            fail: Some("bad"),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let stats = StatsService::spawn(&StatsConfig::default(), cancel.clone());
        let err = process_file(&input, &output, &invoker, &stats.handle(), cancel)
            .await
            .unwrap_err();
        stats.stop().await;

        assert!(matches!(err, Error::Remote(_)));
        assert_eq!(
            invoker.calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }
}
