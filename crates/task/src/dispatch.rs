//! The dispatch loop
//!
//! One task per scheduler. Each tick finalizes finished runs, cancels
//! overdue ones and fills free slots, then sleeps for `tick_interval`. A
//! tick that errors or panics is logged and followed by the longer
//! `error_backoff`; the loop only exits on shutdown.

use crate::scheduler::SchedulerInner;
use kiln_core::SchedulerEvent;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Weak;
use tokio::sync::watch;

pub(crate) async fn run(inner: Weak<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!("Dispatch loop started");
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let Some(scheduler) = inner.upgrade() else {
            break;
        };

        let pause = match panic::catch_unwind(AssertUnwindSafe(|| scheduler.tick())) {
            Ok(Ok(())) => scheduler.config.tick_interval,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Dispatch tick failed");
                scheduler.bus.publish(SchedulerEvent::Error {
                    task_id: None,
                    message: format!("dispatch tick failed: {e}"),
                });
                scheduler.config.error_backoff
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(panic = %message, "Dispatch tick panicked");
                scheduler.bus.publish(SchedulerEvent::Error {
                    task_id: None,
                    message: format!("dispatch tick panicked: {message}"),
                });
                scheduler.config.error_backoff
            }
        };
        drop(scheduler);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Dispatch loop exited");
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
