//! Transfer executor
//!
//! Runs one send -> receive replication. The two ends are pumped by two
//! tokio tasks joined through a bounded channel, so the receiver consumes
//! while the sender is still producing and at most `PIPE_DEPTH` chunks are
//! in flight. Both stages and both pumps contribute to the outcome: any one
//! of them failing fails the transfer.

use crate::backend::{ReceiveSink, SendStream, StorageBackend};
use crate::capacity::CapacityGate;
use chrono::Utc;
use holdfast_common::{format_size, Error, SnapshotName, Transfer, TransferMode, TransferOutcome};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bytes read from the send stream per chunk
pub const PIPE_CHUNK: usize = 128 * 1024;
/// Chunks buffered between the two stages
pub const PIPE_DEPTH: usize = 16;

#[derive(Clone)]
pub struct TransferExecutor {
    backend: Arc<dyn StorageBackend>,
    gate: CapacityGate,
}

impl TransferExecutor {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            gate: CapacityGate::new(backend.clone()),
            backend,
        }
    }

    /// Replicate `target` into `<pool>/<target filesystem>`
    pub async fn execute(&self, target: &SnapshotName, mode: TransferMode, pool: &str) -> Transfer {
        let destination = format!("{}/{}", pool, target.filesystem);
        let mut transfer = Transfer {
            target: target.clone(),
            mode,
            destination,
            estimated_bytes: 0,
            bytes_transferred: 0,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcome: TransferOutcome::TransferError,
            diagnostics: None,
        };
        let base = transfer.mode.base().cloned();

        match self.gate.check(target, base.as_ref(), pool).await {
            Ok(clearance) => transfer.estimated_bytes = clearance.estimated,
            Err(e @ Error::CapacityExceeded { .. }) => {
                warn!("Not sending {} to {}: {}", target, pool, e);
                return finish(transfer, TransferOutcome::SizeExceeded, Some(e.to_string()));
            }
            Err(e) => {
                error!("Size query for {} ({}) failed: {}", target, transfer.mode, e);
                return finish(transfer, TransferOutcome::TransferError, Some(e.to_string()));
            }
        }

        info!(
            snapshot = %target,
            base = ?base.as_ref().map(|b| b.label.as_str()),
            size = transfer.estimated_bytes,
            "Sending {} ({}, {}) to {}",
            target,
            transfer.mode,
            format_size(transfer.estimated_bytes),
            transfer.destination
        );

        let send = match self.backend.open_send_stream(target, base.as_ref()).await {
            Ok(send) => send,
            Err(e) => {
                error!("Could not start send of {}: {}", target, e);
                return finish(transfer, TransferOutcome::TransferError, Some(e.to_string()));
            }
        };
        let sink = match self.backend.open_receive_sink(pool, &target.filesystem).await {
            Ok(sink) => sink,
            Err(e) => {
                error!("Could not start receive into {}: {}", transfer.destination, e);
                return finish(transfer, TransferOutcome::TransferError, Some(e.to_string()));
            }
        };

        let piped = pipe(send, sink).await;
        transfer.bytes_transferred = piped.bytes;
        let transfer = if piped.failures.is_empty() {
            finish(transfer, TransferOutcome::Success, None)
        } else {
            let err = Error::Transfer(piped.failures.join("; "));
            finish(transfer, TransferOutcome::TransferError, Some(err.to_string()))
        };

        match &transfer.diagnostics {
            None => info!(
                snapshot = %target,
                size = transfer.bytes_transferred,
                elapsed = ?transfer.elapsed(),
                "Replicated {} to {}: {} in {:.1?}",
                target,
                transfer.destination,
                format_size(transfer.bytes_transferred),
                transfer.elapsed()
            ),
            Some(diagnostics) => error!(
                snapshot = %target,
                "Replication of {} to {} failed after {:.1?}: {}",
                target,
                transfer.destination,
                transfer.elapsed(),
                diagnostics
            ),
        }
        transfer
    }
}

fn finish(mut transfer: Transfer, outcome: TransferOutcome, diagnostics: Option<String>) -> Transfer {
    transfer.finished_at = Utc::now();
    transfer.outcome = outcome;
    transfer.diagnostics = diagnostics;
    transfer
}

/// What came out of one pipe run
#[derive(Debug, Default)]
struct Piped {
    bytes: u64,
    failures: Vec<String>,
}

async fn pipe(send: SendStream, sink: ReceiveSink) -> Piped {
    let SendStream { stage: send_stage, reader: mut input, completion: send_done } = send;
    let ReceiveSink { stage: recv_stage, writer: mut output, completion: recv_done } = sink;
    debug!("pipe: {} | {}", send_stage, recv_stage);

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);

    let producer = tokio::spawn(async move {
        let mut total = 0u64;
        loop {
            let mut chunk = vec![0u8; PIPE_CHUNK];
            let n = input.read(&mut chunk).await?;
            if n == 0 {
                return Ok::<u64, std::io::Error>(total);
            }
            chunk.truncate(n);
            total += n as u64;
            if tx.send(chunk).await.is_err() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "receiving side closed the stream",
                ));
            }
        }
    });

    let consumer = tokio::spawn(async move {
        let mut total = 0u64;
        while let Some(chunk) = rx.recv().await {
            output.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        output.shutdown().await?;
        Ok::<u64, std::io::Error>(total)
    });

    let mut piped = Piped::default();
    let produced = pump_result(producer.await, &send_stage, &mut piped.failures);
    let consumed = pump_result(consumer.await, &recv_stage, &mut piped.failures);
    piped.bytes = consumed.or(produced).unwrap_or(0);

    for (stage, done) in [(send_stage, send_done), (recv_stage, recv_done)] {
        let exit = done.wait().await;
        if !exit.is_success() {
            let status = match exit.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated".to_string(),
            };
            if exit.diagnostics.is_empty() {
                piped.failures.push(format!("{}: {}", stage, status));
            } else {
                piped.failures.push(format!("{}: {} ({})", stage, exit.diagnostics, status));
            }
        }
    }
    piped
}

fn pump_result(
    joined: std::result::Result<std::io::Result<u64>, tokio::task::JoinError>,
    stage: &str,
    failures: &mut Vec<String>,
) -> Option<u64> {
    match joined {
        Ok(Ok(bytes)) => Some(bytes),
        Ok(Err(e)) => {
            failures.push(format!("{}: stream error: {}", stage, e));
            None
        }
        Err(e) => {
            failures.push(format!("{}: pump task failed: {}", stage, e));
            None
        }
    }
}
