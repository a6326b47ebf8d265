use std::future::Future;
use std::time::Duration;

/// Runs `action` until `is_success` accepts its output or `attempts` are exhausted,
/// sleeping for `backoff` between attempts. The action receives the attempt number
/// (starting at 1).
///
/// Returns `Ok` with the accepted value, or `Err` with the last rejected one.
/// At least one attempt is always made.
pub async fn retry_until<T, F, Fut, P>(
    attempts: u32,
    backoff: Duration,
    mut action: F,
    is_success: P,
) -> Result<T, T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let value = action(attempt).await;
        if is_success(&value) {
            return Ok(value);
        }
        if attempt >= attempts {
            return Err(value);
        }
        log::debug!("Attempt {attempt}/{attempts} was not successful, retrying in {backoff:?}");
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::retry_until;
    use std::time::Duration;

    #[tokio::test]
    async fn stops_on_first_success() {
        let mut calls = 0;
        let result = retry_until(
            10,
            Duration::ZERO,
            |attempt| {
                calls += 1;
                async move { attempt }
            },
            |attempt| *attempt == 3,
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn returns_last_value_when_exhausted() {
        let result = retry_until(4, Duration::ZERO, |attempt| async move { attempt }, |_| false).await;
        assert_eq!(result, Err(4));
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let result = retry_until(0, Duration::ZERO, |attempt| async move { attempt }, |_| false).await;
        assert_eq!(result, Err(1));
    }
}
