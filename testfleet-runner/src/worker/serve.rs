// Copyright (c) The testfleet Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{Isolation, TestExecutor};
use crate::errors::WorkerServeError;
use testfleet_metadata::{WorkRequest, WorkResponse};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Runs the worker side of the protocol until the controller asks the worker to exit or closes
/// the request stream.
///
/// Announces readiness first, then answers each execute request in order.
pub async fn serve<R, W>(
    executor: &TestExecutor,
    reader: R,
    mut writer: W,
) -> Result<(), WorkerServeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ready = WorkResponse::Ready {
        pid: std::process::id(),
    };
    write_response(&mut writer, &ready).await?;

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.map_err(WorkerServeError::Read)? {
        if line.trim().is_empty() {
            continue;
        }
        match WorkRequest::from_line(&line)? {
            WorkRequest::Execute(request) => {
                debug!("running `{}`", request.test_id);
                let response = executor.run(request, Isolation::Inherit).await;
                write_response(&mut writer, &WorkResponse::Completed(response)).await?;
            }
            WorkRequest::Exit => {
                debug!("exit requested");
                return Ok(());
            }
        }
    }

    debug!("request stream closed");
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &WorkResponse,
) -> Result<(), WorkerServeError> {
    writer
        .write_all(response.to_line().as_bytes())
        .await
        .map_err(WorkerServeError::Write)?;
    writer.flush().await.map_err(WorkerServeError::Write)
}
