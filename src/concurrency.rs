use crate::config::Config;
use crate::db as dbmod;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bounded worker budget per caller, so one noisy dependent can't starve the process
/// of database/vector-store/object-store connections (§4.10).
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(capacity)) }
    }

    /// Runs `f` once a permit is available, releasing it when `f` completes.
    pub async fn run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        f().await
    }
}

/// Generic exponential backoff retry, parameterised per call site. §4.5's model-adapter
/// policy is a specialisation of this same shape with its own retryable-error predicate.
pub async fn retry_with_backoff<F, Fut, T, E>(
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    is_retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut delay = base;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, cap);
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Reduction rule: any `unhealthy` -> overall `unhealthy`; else any `degraded` ->
/// `degraded`; else `healthy`.
pub fn reduce_health(statuses: &[HealthStatus]) -> HealthStatus {
    if statuses.iter().any(|s| *s == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if statuses.iter().any(|s| *s == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(serde::Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub detail: Option<String>,
}

#[derive(serde::Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub dependencies: Vec<DependencyHealth>,
}

/// Runs dependency checks concurrently, bounded by a deadline (§4.10), and reduces
/// to one overall status. A check that misses the deadline counts as `unhealthy`.
pub async fn aggregate_health(
    checks: Vec<(&'static str, std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>)>,
    deadline: Duration,
) -> HealthReport {
    let mut dependencies = Vec::with_capacity(checks.len());
    let futures = checks.into_iter().map(|(name, fut)| async move {
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(())) => DependencyHealth { name: name.to_string(), status: HealthStatus::Healthy, detail: None },
            Ok(Err(msg)) => DependencyHealth { name: name.to_string(), status: HealthStatus::Degraded, detail: Some(msg) },
            Err(_) => DependencyHealth {
                name: name.to_string(),
                status: HealthStatus::Unhealthy,
                detail: Some("deadline exceeded".to_string()),
            },
        }
    });

    for result in futures::future::join_all(futures).await {
        dependencies.push(result);
    }

    let status = reduce_health(&dependencies.iter().map(|d| d.status).collect::<Vec<_>>());
    HealthReport { status, dependencies }
}

/// Generalizes the teacher's `tokio::spawn` tick-loop into a maintenance loop that
/// performs the time-triggered `active -> expired` license sweep. Both this sweep and
/// rate-counter/nonce hygiene are lazily re-evaluated on read anyway, so this loop is a
/// prompt-cleanup optimization, never the correctness mechanism.
pub fn spawn_maintenance_loop(pool: sqlx::Pool<sqlx::Postgres>, _config: Config) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            match dbmod::mark_expired_licenses(&pool).await {
                Ok(count) if count > 0 => tracing::info!(count, "swept expired licenses"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "license sweep failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_health_prefers_unhealthy_over_degraded() {
        let statuses = [HealthStatus::Healthy, HealthStatus::Degraded, HealthStatus::Unhealthy];
        assert_eq!(reduce_health(&statuses), HealthStatus::Unhealthy);
    }

    #[test]
    fn reduce_health_degraded_without_unhealthy() {
        let statuses = [HealthStatus::Healthy, HealthStatus::Degraded];
        assert_eq!(reduce_health(&statuses), HealthStatus::Degraded);
    }

    #[test]
    fn reduce_health_all_healthy() {
        let statuses = [HealthStatus::Healthy, HealthStatus::Healthy];
        assert_eq!(reduce_health(&statuses), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn retry_with_backoff_stops_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
            |_e: &&str| true,
            || {
                calls += 1;
                async move { Err("boom") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_does_not_retry_non_retryable() {
        let mut calls = 0;
        let result: Result<(), &str> = retry_with_backoff(
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
            |_e: &&str| false,
            || {
                calls += 1;
                async move { Err("fatal") }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new(1);
        let result = pool.run(|| async { 42 }).await;
        assert_eq!(result, 42);
    }
}
