//! Try alternative agent configurations in order until one connects.

use std::future::Future;

use crate::config::{ExecutionSpec, SpecError};
use crate::supervisor::SupervisorError;

/// Connect with the first alternative that succeeds.
///
/// Each failed attempt is logged and recorded. When all fail, the error
/// carries a one-line summary per attempt and the full last failure.
pub async fn connect_first<'s, T, F, Fut>(
    alternatives: &'s [ExecutionSpec],
    mut connect: F,
) -> Result<T, SupervisorError>
where
    F: FnMut(&'s ExecutionSpec) -> Fut,
    Fut: Future<Output = Result<T, SupervisorError>>,
{
    let mut summary = Vec::with_capacity(alternatives.len());
    let mut last = None;

    for (attempt, spec) in alternatives.iter().enumerate() {
        match connect(spec).await {
            Ok(control) => {
                if attempt > 0 {
                    tracing::info!(attempt, %spec, "Connected after failover");
                }
                return Ok(control);
            }
            Err(e) => {
                tracing::warn!(attempt, %spec, error = %e, "Execution provider failed");
                let first_line = e.to_string().lines().next().unwrap_or_default().to_string();
                summary.push(format!("{attempt}: {spec}: {first_line}"));
                last = Some(e);
            }
        }
    }

    match last {
        Some(last) => Err(SupervisorError::Exhausted {
            attempts: summary.len(),
            summary: summary.join("\n"),
            last: Box::new(last),
        }),
        None => Err(SpecError::NoAlternatives.into()),
    }
}
