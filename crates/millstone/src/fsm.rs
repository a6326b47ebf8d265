//! Job status transitions driven by executor reports.

use crate::common::error::MillError;
use crate::job::{JobStatus, TaskStatus};

/// Computes the control-plane status that follows `current` once the executor
/// reported `reported`.
///
/// A job in `DO_CANCELING` always ends `CANCELED`: the stop signal has been
/// delivered and whatever the executor says about its own outcome is ignored.
/// Terminal jobs never transition again.
pub fn next_status(current: JobStatus, reported: TaskStatus) -> crate::Result<JobStatus> {
    if current == JobStatus::DoCanceling {
        return Ok(JobStatus::Canceled);
    }
    if current.is_terminated() {
        return Err(MillError::IllegalTransition { current, reported });
    }
    let next = match reported {
        TaskStatus::Done => JobStatus::Done,
        TaskStatus::Failed => JobStatus::Failed,
        TaskStatus::Canceled => JobStatus::Canceled,
        TaskStatus::Preparing | TaskStatus::Running | TaskStatus::Abnormal => match current {
            JobStatus::Canceling => JobStatus::Canceling,
            _ => JobStatus::Running,
        },
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::next_status;
    use crate::common::error::MillError;
    use crate::job::{JobStatus, TaskStatus};

    const ALL_REPORTS: [TaskStatus; 6] = [
        TaskStatus::Preparing,
        TaskStatus::Running,
        TaskStatus::Abnormal,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    #[test]
    fn do_canceling_always_ends_canceled() {
        for reported in ALL_REPORTS {
            assert_eq!(
                next_status(JobStatus::DoCanceling, reported).unwrap(),
                JobStatus::Canceled
            );
        }
    }

    #[test]
    fn running_follows_executor_outcome() {
        assert_eq!(
            next_status(JobStatus::Running, TaskStatus::Done).unwrap(),
            JobStatus::Done
        );
        assert_eq!(
            next_status(JobStatus::Running, TaskStatus::Failed).unwrap(),
            JobStatus::Failed
        );
        assert_eq!(
            next_status(JobStatus::Running, TaskStatus::Canceled).unwrap(),
            JobStatus::Canceled
        );
        assert_eq!(
            next_status(JobStatus::Running, TaskStatus::Abnormal).unwrap(),
            JobStatus::Running
        );
        assert_eq!(
            next_status(JobStatus::PreparingResr, TaskStatus::Running).unwrap(),
            JobStatus::Running
        );
    }

    #[test]
    fn canceling_keeps_waiting_for_stop() {
        assert_eq!(
            next_status(JobStatus::Canceling, TaskStatus::Running).unwrap(),
            JobStatus::Canceling
        );
        assert_eq!(
            next_status(JobStatus::Canceling, TaskStatus::Done).unwrap(),
            JobStatus::Done
        );
    }

    #[test]
    fn terminal_jobs_reject_reports() {
        for current in [
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Canceled,
            JobStatus::Timeout,
        ] {
            let err = next_status(current, TaskStatus::Done).unwrap_err();
            assert!(matches!(err, MillError::IllegalTransition { .. }));
        }
    }
}
