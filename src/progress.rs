// Progress driver - the cancellable tick/sleep loop behind a progress bar
//
// Runs the step once per tick 0..=total with an interval sleep between
// ticks, recording current/total on the handle and rendering the percentage
// through the group's affinity dispatcher after each step. Cancellation
// halts the sequence at the next tick; progress already committed is not
// rolled back.

use crate::error::{TaskError, TaskResult};
use crate::group::TaskGroup;
use crate::handle::TaskHandle;
use crate::types::TaskProgress;
use std::time::Duration;

impl TaskGroup<u64> {
    /// Spawn a progress-driving task in this group. The returned handle
    /// completes with `total` after the final tick, or Cancelled if the run
    /// was halted mid-sequence.
    pub fn drive_progress<F>(
        &self,
        total: u64,
        interval: Duration,
        mut step: F,
    ) -> TaskResult<TaskHandle<u64>>
    where
        F: FnMut() + Send + 'static,
    {
        let handle = self.register("progress")?;
        let reporter = handle.clone();
        let ui = self.render().cloned();

        handle.start(move |token| async move {
            for current in 0..=total {
                if current > 0 {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(TaskError::Cancelled(
                                "progress run halted".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }
                }

                step();

                let progress = TaskProgress::new(current, Some(total));
                let percent = progress.percentage.unwrap_or(0.0).round() as u8;
                let delivered = reporter.report_progress(progress, |_| {
                    if let Some(ui) = &ui {
                        ui.render_progress(percent);
                    }
                });
                // A report refused after the step means cancellation won the
                // race; stop without emitting anything further.
                if !delivered {
                    return Err(TaskError::Cancelled("progress run halted".to_string()));
                }
            }
            Ok(total)
        });

        Ok(handle)
    }
}
