//! Leak protection for an active tunnel. One dynamic filter-engine session
//! holds every filter; closing it removes them all at once.

pub mod memory;
pub mod rules;
#[cfg(windows)]
pub mod wfp;

pub use memory::MemoryEngine;
pub use rules::{AdapterId, FilterSpec, Provider, RuleSet, Sublayer, build_rule_set};

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("The firewall has already been enabled")]
    AlreadyEnabled,
    #[error("The firewall is not supported on this platform")]
    Unsupported,
    #[error("{operation} failed: 0x{code:08x}")]
    Engine { operation: &'static str, code: u32 },
    #[error("Unable to add filter '{name}': {source}")]
    Filter {
        name: String,
        #[source]
        source: Box<FirewallError>,
    },
    #[error("Filter engine misuse: {0}")]
    InvalidState(&'static str),
}

/// A kernel filtering engine with dynamic sessions and transactions.
pub trait FilterEngine {
    fn open_session(&mut self) -> Result<(), FirewallError>;
    fn begin_transaction(&mut self) -> Result<(), FirewallError>;
    fn add_provider(&mut self, provider: &Provider) -> Result<(), FirewallError>;
    fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), FirewallError>;
    fn add_filter(&mut self, filter: &FilterSpec) -> Result<u64, FirewallError>;
    fn commit_transaction(&mut self) -> Result<(), FirewallError>;
    fn abort_transaction(&mut self);
    /// Releases the session together with every object created under it.
    fn close_session(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallState {
    Closed,
    Open,
    Populating,
    Committed,
}

/// Owned by the tunnel worker. `enable` takes `&mut self`, so two enables
/// can never race.
pub struct Firewall<E: FilterEngine> {
    engine: E,
    state: FirewallState,
}

impl<E: FilterEngine> Firewall<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            state: FirewallState::Closed,
        }
    }

    pub fn state(&self) -> FirewallState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == FirewallState::Committed
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Installs the complete rule set for `adapter`, or nothing at all.
    pub fn enable(
        &mut self,
        adapter: AdapterId,
        restrict_dns: bool,
        restrict_all: bool,
    ) -> Result<(), FirewallError> {
        if self.state != FirewallState::Closed {
            return Err(FirewallError::AlreadyEnabled);
        }

        self.engine.open_session()?;
        self.state = FirewallState::Open;

        if let Err(e) = self.engine.begin_transaction() {
            self.close();
            return Err(e);
        }
        self.state = FirewallState::Populating;

        let rules = build_rule_set(adapter, restrict_dns, restrict_all);
        let installed = self.install(&rules).and_then(|count| {
            self.engine.commit_transaction()?;
            Ok(count)
        });

        match installed {
            Ok(count) => {
                self.state = FirewallState::Committed;
                tracing::info!(
                    "Firewall enabled with {} filters (restrict_dns={}, restrict_all={})",
                    count,
                    restrict_dns,
                    restrict_all
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Aborting firewall transaction: {}", e);
                self.engine.abort_transaction();
                self.close();
                Err(e)
            }
        }
    }

    pub fn disable(&mut self) {
        if self.state != FirewallState::Closed {
            self.close();
            tracing::info!("Firewall disabled");
        }
    }

    fn install(&mut self, rules: &RuleSet) -> Result<usize, FirewallError> {
        self.engine.add_provider(&rules.provider)?;
        for sublayer in &rules.sublayers {
            self.engine.add_sublayer(sublayer)?;
        }
        for filter in &rules.filters {
            self.engine
                .add_filter(filter)
                .map_err(|e| FirewallError::Filter {
                    name: filter.name.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(rules.filters.len())
    }

    fn close(&mut self) {
        self.engine.close_session();
        self.state = FirewallState::Closed;
    }
}

impl<E: FilterEngine> Drop for Firewall<E> {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Engine for platforms without a supported kernel filter.
#[derive(Debug, Default)]
pub struct UnsupportedEngine;

impl FilterEngine for UnsupportedEngine {
    fn open_session(&mut self) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    fn begin_transaction(&mut self) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    fn add_provider(&mut self, _provider: &Provider) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    fn add_sublayer(&mut self, _sublayer: &Sublayer) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    fn add_filter(&mut self, _filter: &FilterSpec) -> Result<u64, FirewallError> {
        Err(FirewallError::Unsupported)
    }

    fn commit_transaction(&mut self) -> Result<(), FirewallError> {
        Err(FirewallError::Unsupported)
    }

    fn abort_transaction(&mut self) {}

    fn close_session(&mut self) {}
}

#[cfg(windows)]
pub type NativeEngine = wfp::WfpEngine;
#[cfg(not(windows))]
pub type NativeEngine = UnsupportedEngine;

pub fn native_firewall() -> Firewall<NativeEngine> {
    Firewall::new(NativeEngine::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADAPTER: AdapterId = AdapterId(42);

    #[test]
    fn test_enable_installs_everything() {
        let mut firewall = Firewall::new(MemoryEngine::default());
        firewall.enable(ADAPTER, true, true).unwrap();

        let expected = build_rule_set(ADAPTER, true, true);
        assert_eq!(firewall.state(), FirewallState::Committed);
        assert_eq!(firewall.engine().filters().len(), expected.filters.len());
        assert_eq!(firewall.engine().sublayers().len(), 2);
        assert_eq!(firewall.engine().providers().len(), 1);
    }

    #[test]
    fn test_second_enable_fails_fast() {
        let mut firewall = Firewall::new(MemoryEngine::default());
        firewall.enable(ADAPTER, false, true).unwrap();
        let before = firewall.engine().filters().len();

        assert!(matches!(
            firewall.enable(ADAPTER, false, true),
            Err(FirewallError::AlreadyEnabled)
        ));
        assert_eq!(firewall.engine().filters().len(), before);
        assert_eq!(firewall.engine().sessions_opened(), 1);
    }

    #[test]
    fn test_mid_transaction_failure_leaves_nothing() {
        let total = build_rule_set(ADAPTER, true, true).filters.len();
        for fail_at in [0, 1, total / 2, total - 1] {
            let mut firewall = Firewall::new(MemoryEngine::failing_at_filter(fail_at));
            let err = firewall.enable(ADAPTER, true, true).unwrap_err();
            assert!(matches!(err, FirewallError::Filter { .. }));

            assert_eq!(firewall.state(), FirewallState::Closed);
            assert!(firewall.engine().filters().is_empty());
            assert!(firewall.engine().sublayers().is_empty());
            assert!(firewall.engine().providers().is_empty());
            assert!(!firewall.engine().session_open());
        }
    }

    #[test]
    fn test_commit_failure_leaves_nothing() {
        let mut firewall = Firewall::new(MemoryEngine::failing_commit());
        assert!(firewall.enable(ADAPTER, false, true).is_err());
        assert!(firewall.engine().filters().is_empty());
        assert!(!firewall.engine().session_open());
    }

    #[test]
    fn test_disable_then_enable_again() {
        let mut firewall = Firewall::new(MemoryEngine::default());
        firewall.enable(ADAPTER, false, false).unwrap();
        firewall.disable();
        assert!(firewall.engine().filters().is_empty());
        assert_eq!(firewall.state(), FirewallState::Closed);

        firewall.enable(ADAPTER, true, false).unwrap();
        assert!(firewall.is_enabled());
    }

    #[test]
    fn test_unsupported_engine_refuses() {
        let mut firewall = Firewall::new(UnsupportedEngine);
        assert!(matches!(
            firewall.enable(ADAPTER, false, false),
            Err(FirewallError::Unsupported)
        ));
        assert_eq!(firewall.state(), FirewallState::Closed);
    }
}
