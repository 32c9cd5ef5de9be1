use std::collections::BTreeMap;

/// Health of a single component this crate's runtime depends on or exposes,
/// e.g. a Kafka consumer's broker connectivity or a pipeline's
/// time-since-last-success probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Failed(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// A single named health check. Implementations must be cheap and
/// non-blocking: `check` may be called on every healthcheck scrape.
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> HealthStatus;
}

impl<F> HealthCheck for F
where
    F: Fn() -> HealthStatus + Send + Sync + 'static,
{
    fn check(&self) -> HealthStatus {
        self()
    }
}

/// Alias for the result of running every registered check.
pub type HealthResults = BTreeMap<String, HealthStatus>;

/// A registry of named health checks. Deliberately unopinionated about how
/// results are served (HTTP, gRPC, a CLI probe, ...): this crate only owns
/// collecting and running the checks.
#[derive(Default)]
pub struct HealthChecks {
    checks: BTreeMap<String, Box<dyn HealthCheck>>,
}

impl HealthChecks {
    pub fn new() -> HealthChecks {
        HealthChecks {
            checks: BTreeMap::new(),
        }
    }

    /// Registers a named check, replacing any existing check under the same
    /// name. Names are operator-facing and should be meaningful to them.
    pub fn register<C, S>(&mut self, name: S, check: C)
    where
        C: HealthCheck + 'static,
        S: Into<String>,
    {
        self.checks.insert(name.into(), Box::new(check));
    }

    /// Runs every registered check and collects the results.
    pub fn run(&self) -> HealthResults {
        self.checks
            .iter()
            .map(|(name, check)| (name.clone(), check.check()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_runs_every_check() {
        let mut checks = HealthChecks::new();
        checks.register("always-healthy", || HealthStatus::Healthy);
        checks.register("always-failed", || HealthStatus::Failed("down".into()));
        let results = checks.run();
        assert_eq!(results.get("always-healthy"), Some(&HealthStatus::Healthy));
        assert_eq!(
            results.get("always-failed"),
            Some(&HealthStatus::Failed("down".into()))
        );
    }

    #[test]
    fn re_registering_a_name_replaces_the_check() {
        let mut checks = HealthChecks::new();
        checks.register("probe", || HealthStatus::Healthy);
        checks.register("probe", || HealthStatus::Degraded("slow".into()));
        let results = checks.run();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results.get("probe"),
            Some(&HealthStatus::Degraded("slow".into()))
        );
    }
}
