//! Per-mod schema migration registry and chain executor.
//!
//! # Responsibility
//! - Register `(from_version, to_version, migrate_fn)` steps for one mod.
//! - Build the step chain from a stored version to the declared current one.
//! - Apply the chain in order before a document becomes visible.
//!
//! # Invariants
//! - Every step strictly increases the version.
//! - A gap in the chain fails the load; migration never silently stops early.
//! - A stored version newer than the current one is rejected, not downgraded.

use super::document::ConfigDocument;
use crate::error::{KernelError, KernelResult};
use log::info;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Migration step body. Returns a human-readable reason on failure.
pub type MigrationFn = Arc<dyn Fn(&mut ConfigDocument) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct MigrationStep {
    pub from_version: u32,
    pub to_version: u32,
    apply: MigrationFn,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MigrationStep({}->{})", self.from_version, self.to_version)
    }
}

struct ChainSearch {
    target: u32,
    chain: Vec<MigrationStep>,
    dead_ends: HashSet<u32>,
    furthest: u32,
}

/// Declared current schema version of one mod plus its migration steps.
#[derive(Clone, Default)]
pub struct SchemaMigrations {
    current_version: u32,
    steps: Vec<MigrationStep>,
}

impl SchemaMigrations {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            steps: Vec::new(),
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub(crate) fn set_current_version(&mut self, version: u32) {
        self.current_version = version;
    }

    /// Registers one migration step.
    ///
    /// # Errors
    /// - `InvalidArgument` when `to_version <= from_version`.
    /// - `AlreadyExists` when a step with the same endpoints exists.
    pub fn register(
        &mut self,
        from_version: u32,
        to_version: u32,
        apply: MigrationFn,
    ) -> KernelResult<()> {
        if to_version <= from_version {
            return Err(KernelError::InvalidArgument(format!(
                "migration must increase the version, got {from_version}->{to_version}"
            )));
        }
        if self
            .steps
            .iter()
            .any(|step| step.from_version == from_version && step.to_version == to_version)
        {
            return Err(KernelError::AlreadyExists(format!(
                "migration {from_version}->{to_version}"
            )));
        }
        self.steps.push(MigrationStep {
            from_version,
            to_version,
            apply,
        });
        Ok(())
    }

    /// Builds the ordered step chain from `stored_version` to the current version.
    ///
    /// Searches depth-first, trying the step that reaches furthest without
    /// overshooting the target first, so the chosen chain is deterministic.
    /// Fails only when no chain reaches the target; the error names the
    /// highest version any attempted chain got to.
    pub fn plan(&self, module: &str, stored_version: u32) -> KernelResult<Vec<MigrationStep>> {
        let target = self.current_version;
        if stored_version > target {
            return Err(KernelError::UnsupportedSchemaVersion {
                module: module.to_string(),
                stored_version,
                latest_supported: target,
            });
        }

        let mut search = ChainSearch {
            target,
            chain: Vec::new(),
            dead_ends: HashSet::new(),
            furthest: stored_version,
        };
        if self.extend_chain(stored_version, &mut search) {
            return Ok(search.chain);
        }
        Err(KernelError::MigrationChainBroken {
            module: module.to_string(),
            from_version: search.furthest,
            target_version: target,
        })
    }

    fn extend_chain(&self, version: u32, search: &mut ChainSearch) -> bool {
        if version == search.target {
            return true;
        }
        if search.dead_ends.contains(&version) {
            return false;
        }
        search.furthest = search.furthest.max(version);

        let mut candidates: Vec<&MigrationStep> = self
            .steps
            .iter()
            .filter(|step| step.from_version == version && step.to_version <= search.target)
            .collect();
        candidates.sort_by(|a, b| b.to_version.cmp(&a.to_version));
        for step in candidates {
            search.chain.push(step.clone());
            if self.extend_chain(step.to_version, search) {
                return true;
            }
            search.chain.pop();
        }
        search.dead_ends.insert(version);
        false
    }

    /// Migrates `document` in place. Returns the number of steps applied.
    ///
    /// Runs caller-supplied code; callers must not hold shared locks.
    pub fn apply(&self, module: &str, document: &mut ConfigDocument) -> KernelResult<usize> {
        let chain = self.plan(module, document.schema_version)?;
        for step in &chain {
            let outcome = catch_unwind(AssertUnwindSafe(|| (step.apply)(document)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(_) => Some("migration function panicked".to_string()),
            };
            if let Some(message) = failure {
                return Err(KernelError::MigrationFailed {
                    module: module.to_string(),
                    from_version: step.from_version,
                    to_version: step.to_version,
                    message,
                });
            }
            document.schema_version = step.to_version;
            info!(
                "event=config_migrate module=config status=ok mod={} from={} to={}",
                module, step.from_version, step.to_version
            );
        }
        Ok(chain.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{MigrationFn, SchemaMigrations};
    use crate::config::{ConfigDocument, ConfigKey, ConfigValue};
    use crate::error::KernelError;
    use std::sync::Arc;

    fn noop() -> MigrationFn {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn plans_linear_chain() {
        let mut schema = SchemaMigrations::new(3);
        schema.register(0, 1, noop()).expect("0->1");
        schema.register(1, 2, noop()).expect("1->2");
        schema.register(2, 3, noop()).expect("2->3");
        let chain = schema.plan("m", 0).expect("plan");
        let hops: Vec<(u32, u32)> = chain
            .iter()
            .map(|step| (step.from_version, step.to_version))
            .collect();
        assert_eq!(hops, vec![(0, 1), (1, 2), (2, 3)]);
        assert!(schema.plan("m", 3).expect("no-op plan").is_empty());
    }

    #[test]
    fn prefers_longest_hop_without_overshoot() {
        let mut schema = SchemaMigrations::new(2);
        schema.register(0, 1, noop()).expect("0->1");
        schema.register(1, 2, noop()).expect("1->2");
        schema.register(0, 2, noop()).expect("0->2");
        schema.register(0, 5, noop()).expect("0->5");
        let chain = schema.plan("m", 0).expect("plan");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].to_version, 2);
    }

    #[test]
    fn backtracks_when_longest_hop_leads_nowhere() {
        let mut schema = SchemaMigrations::new(3);
        schema.register(0, 1, noop()).expect("0->1");
        schema.register(1, 3, noop()).expect("1->3");
        schema.register(0, 2, noop()).expect("0->2");
        let chain = schema.plan("m", 0).expect("0->1->3 exists");
        let hops: Vec<(u32, u32)> = chain
            .iter()
            .map(|step| (step.from_version, step.to_version))
            .collect();
        assert_eq!(hops, vec![(0, 1), (1, 3)]);
    }

    #[test]
    fn missing_segment_fails() {
        let mut schema = SchemaMigrations::new(3);
        schema.register(0, 1, noop()).expect("0->1");
        schema.register(2, 3, noop()).expect("2->3");
        let err = schema.plan("m", 0).expect_err("gap must fail");
        assert!(matches!(
            err,
            KernelError::MigrationChainBroken {
                from_version: 1,
                target_version: 3,
                ..
            }
        ));
    }

    #[test]
    fn rejects_newer_stored_version_and_bad_steps() {
        let mut schema = SchemaMigrations::new(1);
        assert!(matches!(
            schema.plan("m", 4),
            Err(KernelError::UnsupportedSchemaVersion { .. })
        ));
        assert!(matches!(
            schema.register(2, 2, noop()),
            Err(KernelError::InvalidArgument(_))
        ));
        schema.register(0, 1, noop()).expect("0->1");
        assert!(matches!(
            schema.register(0, 1, noop()),
            Err(KernelError::AlreadyExists(_))
        ));
    }

    #[test]
    fn apply_runs_steps_in_order_and_reports_failures() {
        let mut schema = SchemaMigrations::new(2);
        schema
            .register(
                0,
                1,
                Arc::new(|doc: &mut ConfigDocument| {
                    doc.rename(&ConfigKey::new("general", "vol"), &ConfigKey::new("audio", "volume"));
                    Ok(())
                }),
            )
            .expect("0->1");
        schema
            .register(
                1,
                2,
                Arc::new(|doc: &mut ConfigDocument| {
                    let key = ConfigKey::new("audio", "volume");
                    match doc.get(&key).and_then(ConfigValue::as_integer) {
                        Some(percent) => {
                            doc.set(&key, ConfigValue::Float(percent as f64 / 100.0));
                            Ok(())
                        }
                        None => Err("volume missing".to_string()),
                    }
                }),
            )
            .expect("1->2");

        let mut doc = ConfigDocument::new(0);
        doc.set(&ConfigKey::new("general", "vol"), ConfigValue::Integer(50));
        assert_eq!(schema.apply("m", &mut doc).expect("apply"), 2);
        assert_eq!(doc.schema_version, 2);
        assert_eq!(
            doc.get(&ConfigKey::new("audio", "volume")),
            Some(&ConfigValue::Float(0.5))
        );

        let mut empty = ConfigDocument::new(0);
        let err = schema.apply("m", &mut empty).expect_err("second step fails");
        assert!(matches!(
            err,
            KernelError::MigrationFailed {
                from_version: 1,
                to_version: 2,
                ..
            }
        ));
        assert_eq!(empty.schema_version, 1);
    }
}
