use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub const WIFI_JOIN: Self = Self::new(20, 500);
    pub const BACKEND_READY: Self = Self::new(10, 500);
    pub const WRITE: Self = Self::new(3, 500);
    pub const TIME_SYNC: Self = Self::new(30, 1_000);

    pub const fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            delay_ms,
        }
    }

    /// Runs `op` up to `max_attempts` times with a fixed delay between attempts.
    ///
    /// `ctx` is handed to both `sleep` and `op` so a single platform object can
    /// provide the delay and the operation. Errors for which `retryable`
    /// returns `false` end the loop immediately.
    pub fn run<X, T, E>(
        &self,
        ctx: &mut X,
        mut sleep: impl FnMut(&mut X, u64),
        mut op: impl FnMut(&mut X, u32) -> Result<T, E>,
        mut retryable: impl FnMut(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        X: ?Sized,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(ctx, attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts || !retryable(&err) => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(_) => {
                    sleep(ctx, self.delay_ms);
                    attempt += 1;
                }
            }
        }
    }

    /// Polls `ready` until it returns `true` or the attempts run out.
    pub fn poll_until<X>(
        &self,
        ctx: &mut X,
        sleep: impl FnMut(&mut X, u64),
        mut ready: impl FnMut(&mut X, u32) -> bool,
    ) -> bool
    where
        X: ?Sized,
    {
        self.run(
            ctx,
            sleep,
            |ctx, attempt| if ready(ctx, attempt) { Ok(()) } else { Err(()) },
            |_| true,
        )
        .is_ok()
    }
}
