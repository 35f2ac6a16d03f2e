use crate::firewall::{FilterEngine, FilterSpec, FirewallError, Provider, Sublayer};

#[derive(Debug, Default, Clone)]
struct Objects {
    providers: Vec<Provider>,
    sublayers: Vec<Sublayer>,
    filters: Vec<FilterSpec>,
}

/// Filter engine that keeps its objects in memory. Objects added inside a
/// transaction only become visible on commit, and closing the session drops
/// everything, like a dynamic kernel session.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    session_open: bool,
    staged: Option<Objects>,
    committed: Objects,
    fail_at_filter: Option<usize>,
    fail_commit: bool,
    filters_attempted: usize,
    sessions_opened: usize,
    next_filter_id: u64,
}

impl MemoryEngine {
    pub fn failing_at_filter(index: usize) -> Self {
        Self {
            fail_at_filter: Some(index),
            ..Default::default()
        }
    }

    pub fn failing_commit() -> Self {
        Self {
            fail_commit: true,
            ..Default::default()
        }
    }

    pub fn providers(&self) -> &[Provider] {
        &self.committed.providers
    }

    pub fn sublayers(&self) -> &[Sublayer] {
        &self.committed.sublayers
    }

    pub fn filters(&self) -> &[FilterSpec] {
        &self.committed.filters
    }

    pub fn session_open(&self) -> bool {
        self.session_open
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened
    }

    fn staged(&mut self) -> Result<&mut Objects, FirewallError> {
        if !self.session_open {
            return Err(FirewallError::InvalidState("no open session"));
        }
        self.staged
            .as_mut()
            .ok_or(FirewallError::InvalidState("no transaction in progress"))
    }
}

impl FilterEngine for MemoryEngine {
    fn open_session(&mut self) -> Result<(), FirewallError> {
        if self.session_open {
            return Err(FirewallError::InvalidState("session already open"));
        }
        self.session_open = true;
        self.sessions_opened += 1;
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), FirewallError> {
        if !self.session_open {
            return Err(FirewallError::InvalidState("no open session"));
        }
        if self.staged.is_some() {
            return Err(FirewallError::InvalidState("transaction already in progress"));
        }
        self.staged = Some(self.committed.clone());
        Ok(())
    }

    fn add_provider(&mut self, provider: &Provider) -> Result<(), FirewallError> {
        self.staged()?.providers.push(provider.clone());
        Ok(())
    }

    fn add_sublayer(&mut self, sublayer: &Sublayer) -> Result<(), FirewallError> {
        let staged = self.staged()?;
        if !staged.providers.iter().any(|p| p.key == sublayer.provider) {
            return Err(FirewallError::InvalidState("sublayer references unknown provider"));
        }
        staged.sublayers.push(sublayer.clone());
        Ok(())
    }

    fn add_filter(&mut self, filter: &FilterSpec) -> Result<u64, FirewallError> {
        let attempt = self.filters_attempted;
        self.filters_attempted += 1;
        if self.fail_at_filter == Some(attempt) {
            return Err(FirewallError::Engine {
                operation: "FwpmFilterAdd0",
                code: 0x8032_0009,
            });
        }

        let staged = self.staged()?;
        if !staged.sublayers.iter().any(|s| s.key == filter.sublayer.key()) {
            return Err(FirewallError::InvalidState("filter references unknown sublayer"));
        }
        staged.filters.push(filter.clone());
        self.next_filter_id += 1;
        Ok(self.next_filter_id)
    }

    fn commit_transaction(&mut self) -> Result<(), FirewallError> {
        if self.fail_commit {
            return Err(FirewallError::Engine {
                operation: "FwpmTransactionCommit0",
                code: 0x8032_000d,
            });
        }
        let staged = self
            .staged
            .take()
            .ok_or(FirewallError::InvalidState("no transaction in progress"))?;
        self.committed = staged;
        Ok(())
    }

    fn abort_transaction(&mut self) {
        self.staged = None;
    }

    fn close_session(&mut self) {
        self.staged = None;
        self.committed = Objects::default();
        self.session_open = false;
    }
}
