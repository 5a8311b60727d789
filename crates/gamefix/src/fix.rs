//! Fix selection by executable name.

use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::session::FixSession;

/// One game's set of patches and hooks.
pub trait Fix: Send + Sync {
    fn name(&self) -> &str;

    /// Module the fix patches; `None` means the main executable.
    fn target_module(&self) -> Option<&str> {
        None
    }

    /// Apply the fix. Individual features should go through
    /// [`FixSession::feature`] so one failure does not abort the rest.
    fn install(&self, session: &mut FixSession) -> Result<()>;
}

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Entry {
    matcher: Matcher,
    fix: Box<dyn Fix>,
}

/// Ordered table of `(matcher, fix)` pairs; the first matcher accepting the
/// executable name wins.
#[derive(Default)]
pub struct FixRegistry {
    entries: Vec<Entry>,
}

impl fmt::Debug for FixRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.fix.name()))
            .finish()
    }
}

impl FixRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, F>(&mut self, matcher: M, fix: F) -> &mut Self
    where
        M: Fn(&str) -> bool + Send + Sync + 'static,
        F: Fix + 'static,
    {
        self.entries.push(Entry {
            matcher: Box::new(matcher),
            fix: Box::new(fix),
        });
        self
    }

    /// Register `fix` for any of `exe_names`, compared ignoring ASCII case.
    pub fn register_exe<F>(&mut self, exe_names: &[&str], fix: F) -> &mut Self
    where
        F: Fix + 'static,
    {
        let names: Vec<String> = exe_names.iter().map(|name| name.to_string()).collect();
        self.register(
            move |exe: &str| names.iter().any(|name| name.eq_ignore_ascii_case(exe)),
            fix,
        )
    }

    pub fn select(&self, exe_name: &str) -> Option<&dyn Fix> {
        let selected = self
            .entries
            .iter()
            .find(|entry| (entry.matcher)(exe_name))
            .map(|entry| entry.fix.as_ref());
        match selected {
            Some(fix) => debug!("Selected fix {} for {}", fix.name(), exe_name),
            None => debug!("No fix registered for {}", exe_name),
        }
        selected
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
