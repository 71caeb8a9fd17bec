//! Bounded retry helper for flaky chain RPC operations.

use std::fmt::Debug;

use tracing::warn;

const MAX_FAILURES: usize = 10;

/// Retries an operation until it succeeds or it has failed
/// `threshold_number` times in a row, at which point the breaker opens
/// and the last error is surfaced.
pub struct CircuitBreaker {
    threshold_number: usize,
    current_failures_in_row: usize,
}

impl CircuitBreaker {
    pub fn execute_in_circuit_breaker<F, T, E>(
        function: F,
        threshold_number: Option<usize>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Debug,
    {
        let mut breaker = Self::new(threshold_number);

        breaker.execute(function)
    }

    pub fn new(threshold_number: Option<usize>) -> Self {
        Self {
            threshold_number: threshold_number.unwrap_or(MAX_FAILURES),
            current_failures_in_row: 0,
        }
    }

    fn is_open(&self) -> bool {
        self.current_failures_in_row >= self.threshold_number
    }

    pub fn execute<F, T, E>(&mut self, mut function: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Debug,
    {
        loop {
            match function() {
                Ok(result) => {
                    self.current_failures_in_row = 0;
                    return Ok(result);
                }
                Err(err) => {
                    self.current_failures_in_row += 1;

                    if self.is_open() {
                        return Err(err);
                    }

                    warn!(
                        failures = self.current_failures_in_row,
                        "operation failed, circuit breaker not open yet: {:?}", err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_the_threshold() {
        let mut attempts = 0;

        let result: Result<(), &str> = CircuitBreaker::execute_in_circuit_breaker(
            || {
                attempts += 1;
                Err("rpc down")
            },
            Some(3),
        );

        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn recovers_when_the_operation_starts_succeeding() {
        let mut attempts = 0;

        let result: Result<u32, &str> = CircuitBreaker::execute_in_circuit_breaker(
            || {
                attempts += 1;
                if attempts < 3 {
                    Err("rpc down")
                } else {
                    Ok(42)
                }
            },
            Some(5),
        );

        assert_eq!(result.unwrap(), 42);
    }
}
