//! State transition implementations for a batch run.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;

use super::RunContext;
use super::types::{Announcing, BatchRun, Completed, Converting, Finalizing, Queued, Tally};
use crate::domain::batch::RunPhase;
use crate::domain::file::PendingFile;
use crate::error::{Result, VolleyError};
use crate::outcome::ConversionOutcome;

impl BatchRun<Queued> {
    /// Tell the submitter the batch has started.
    pub async fn announce(self, ctx: &RunContext) -> Result<BatchRun<Announcing>> {
        let data = self.data;
        ctx.store
            .set_phase(data.submitter, data.batch_id, RunPhase::Announcing)?;

        tracing::info!(
            submitter = %data.submitter,
            batch_id = %data.batch_id,
            file_count = data.files.len(),
            "Processing batch"
        );

        let text = format!("🔄 Converting {} files...", data.files.len());
        if let Err(e) = ctx
            .services
            .transport
            .edit_message(data.chat_id, data.status_message, &text)
            .await
        {
            tracing::warn!(batch_id = %data.batch_id, error = %e, "Failed to update processing status");
        }

        Ok(BatchRun {
            state: Announcing {
                claimed_at: self.state.claimed_at,
            },
            data,
        })
    }
}

impl BatchRun<Announcing> {
    pub fn start_conversion(self, ctx: &RunContext) -> Result<BatchRun<Converting>> {
        ctx.store
            .set_phase(self.data.submitter, self.data.batch_id, RunPhase::Converting)?;
        Ok(BatchRun {
            state: Converting {
                claimed_at: self.state.claimed_at,
                started_at: Utc::now(),
            },
            data: self.data,
        })
    }
}

impl BatchRun<Converting> {
    /// Validate, convert and deliver every file in arrival order.
    ///
    /// A failing file is reported and counted; it never stops the files after it.
    pub async fn convert_all(self, ctx: &RunContext) -> Result<BatchRun<Finalizing>> {
        let data = self.data;
        let mut tally = Tally::new(data.files.len());

        for (i, file) in data.files.iter().enumerate() {
            let result = AssertUnwindSafe(process_file(ctx, data.submitter, file))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(VolleyError::Other(anyhow::anyhow!(
                        "{} panicked: {}",
                        file.filename,
                        panic_message(panic.as_ref())
                    )))
                });
            match result {
                Ok(()) => tally.record_success(),
                Err(e) => {
                    tally.record_failure();
                    let message = e.outcome_message();
                    if e.is_per_file() {
                        tracing::info!(
                            batch_id = %data.batch_id,
                            filename = %file.filename,
                            reason = %message,
                            "File failed"
                        );
                    } else {
                        tracing::error!(
                            batch_id = %data.batch_id,
                            filename = %file.filename,
                            error = %e,
                            "Error processing file"
                        );
                    }

                    let text = format!("❌ {}\n{}", file.filename, message);
                    if let Err(e) = ctx.services.transport.send_message(data.chat_id, &text).await {
                        tracing::warn!(filename = %file.filename, error = %e, "Failed to send error message");
                    }
                    record(
                        ctx,
                        ConversionOutcome::failed(data.submitter, &file.filename, file.size(), message),
                    )
                    .await;
                }
            }

            if tally.progress_due(ctx.progress_report_every)
                && let Err(e) = ctx
                    .services
                    .transport
                    .edit_message(data.chat_id, data.status_message, &tally.progress_text())
                    .await
            {
                tracing::warn!(batch_id = %data.batch_id, error = %e, "Failed to send progress update");
            }

            if i + 1 < data.files.len() && !ctx.inter_file_pacing.is_zero() {
                tokio::time::sleep(ctx.inter_file_pacing).await;
            }
        }

        ctx.store
            .set_phase(data.submitter, data.batch_id, RunPhase::Finalizing)?;

        Ok(BatchRun {
            state: Finalizing {
                claimed_at: self.state.claimed_at,
                tally,
            },
            data,
        })
    }
}

impl BatchRun<Finalizing> {
    /// Post the summary and release the submitter's slot.
    pub async fn complete(self, ctx: &RunContext) -> Result<BatchRun<Completed>> {
        let data = self.data;
        let tally = self.state.tally;

        if let Err(e) = ctx
            .services
            .transport
            .edit_message(data.chat_id, data.status_message, &tally.summary_text())
            .await
        {
            tracing::warn!(batch_id = %data.batch_id, error = %e, "Failed to update final status");
        }

        if !ctx.store.mark_completed(data.submitter, data.batch_id) {
            return Err(VolleyError::StaleBatch(data.submitter, data.batch_id));
        }

        tracing::info!(
            submitter = %data.submitter,
            batch_id = %data.batch_id,
            converted = tally.converted,
            failed = tally.failed,
            "Batch completed"
        );

        Ok(BatchRun {
            state: Completed {
                claimed_at: self.state.claimed_at,
                completed_at: Utc::now(),
                tally,
            },
            data,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn process_file(
    ctx: &RunContext,
    submitter: crate::domain::batch::SubmitterId,
    file: &PendingFile,
) -> Result<()> {
    let verdict = ctx
        .services
        .validator
        .validate(&file.content, &file.filename)
        .await?;
    if !verdict.accepted {
        return Err(VolleyError::ValidationFailed(verdict.message));
    }

    let conversion = ctx
        .services
        .converter
        .convert(&file.content, &file.filename)
        .await?;
    let Some(artifact) = conversion.artifact().cloned() else {
        return Err(VolleyError::ConversionFailed(conversion.message));
    };

    let output_name = ctx.services.converter.output_filename(&file.filename);
    let caption = format!("✅ {} → {}", file.filename, output_name);
    ctx.services
        .transport
        .send_artifact(file.chat_id, artifact, &output_name, &caption)
        .await?;

    record(
        ctx,
        ConversionOutcome::succeeded(submitter, &file.filename, file.size()),
    )
    .await;
    Ok(())
}

async fn record(ctx: &RunContext, outcome: ConversionOutcome) {
    if let Err(e) = ctx.services.outcomes.record_outcome(&outcome).await {
        tracing::warn!(
            submitter = %outcome.submitter,
            filename = %outcome.filename,
            error = %e,
            "Failed to record conversion outcome"
        );
    }
}
