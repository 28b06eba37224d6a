/// Retry an async operation with exponential backoff and jitter.
/// `$operation` is re-evaluated on every attempt; the final error is
/// returned once `$max_attempts` is exhausted.
macro_rules! retry_with_backoff {
    ($context:expr, $max_attempts:expr, $operation:expr) => {{
        const BASE_DELAY_MS: u64 = 500;
        const MAX_DELAY_MS: u64 = 10_000;

        let context_value: String = $context.into();
        let max_attempts: u32 = $max_attempts;
        let mut attempt: u32 = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= max_attempts => break Err(err),
                Err(err) => {
                    let delay_ms =
                        (BASE_DELAY_MS * 2_u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                    let jitter_range = (delay_ms as f64 * 0.25) as u64;
                    let jitter = fastrand::u64(0..=jitter_range * 2);
                    let final_delay = delay_ms
                        .saturating_sub(jitter_range)
                        .saturating_add(jitter);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        max_attempts,
                        context_value,
                        err,
                        final_delay
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(final_delay)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_with_backoff;
