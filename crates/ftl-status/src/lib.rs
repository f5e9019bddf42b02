//! ftl-status — module lifecycle states surfaced to the console.
//!
//! The scaling engines report transitions to a [`StatusSink`]. The
//! terminal sink keeps one summary line on stderr, the memory sink keeps a
//! snapshot for callers and tests.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

/// Module name that never gets a status entry.
pub const BUILTIN_MODULE: &str = "builtin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Waiting,
    Building,
    Built,
    Deploying,
    Deployed,
    Failed,
    Terminated,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Waiting => "waiting",
            ModuleState::Building => "building",
            ModuleState::Built => "built",
            ModuleState::Deploying => "deploying",
            ModuleState::Deployed => "deployed",
            ModuleState::Failed => "failed",
            ModuleState::Terminated => "terminated",
        }
    }

    /// ANSI foreground colour.
    fn colour(&self) -> &'static str {
        match self {
            ModuleState::Waiting => "\x1b[93m",
            ModuleState::Building | ModuleState::Deploying => "\x1b[94m",
            ModuleState::Built | ModuleState::Deployed => "\x1b[92m",
            ModuleState::Failed => "\x1b[91m",
            ModuleState::Terminated => "\x1b[90m",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives module state transitions.
pub trait StatusSink: Send + Sync {
    fn set_module_state(&self, module: &str, state: ModuleState);
}

pub type SharedStatus = Arc<dyn StatusSink>;

/// Discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatus;

impl StatusSink for NoopStatus {
    fn set_module_state(&self, _module: &str, _state: ModuleState) {}
}

/// Keeps the latest state per module.
#[derive(Debug, Default)]
pub struct MemoryStatus {
    states: RwLock<BTreeMap<String, ModuleState>>,
    history: Mutex<Vec<(String, ModuleState)>>,
}

impl MemoryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, module: &str) -> Option<ModuleState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ModuleState> {
        self.states.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Every transition in the order it was reported.
    pub fn history(&self) -> Vec<(String, ModuleState)> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl StatusSink for MemoryStatus {
    fn set_module_state(&self, module: &str, state: ModuleState) {
        if module == BUILTIN_MODULE {
            return;
        }
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.to_string(), state);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((module.to_string(), state));
    }
}

struct Screen {
    states: BTreeMap<String, ModuleState>,
    out: Box<dyn Write + Send>,
}

/// Renders all module states as a single, redrawn line.
pub struct TerminalStatus {
    screen: Mutex<Screen>,
    ansi: bool,
}

impl TerminalStatus {
    /// Draw on stderr.
    pub fn stderr() -> Self {
        Self::with_writer(Box::new(io::stderr()), true)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, ansi: bool) -> Self {
        Self {
            screen: Mutex::new(Screen {
                states: BTreeMap::new(),
                out,
            }),
            ansi,
        }
    }

    fn render(&self, states: &BTreeMap<String, ModuleState>) -> String {
        let entries: Vec<String> = states
            .iter()
            .map(|(module, state)| {
                if self.ansi {
                    format!("\x1b[97m{module}: {}{state}\x1b[39m", state.colour())
                } else {
                    format!("{module}: {state}")
                }
            })
            .collect();
        entries.join("  ")
    }
}

impl StatusSink for TerminalStatus {
    fn set_module_state(&self, module: &str, state: ModuleState) {
        if module == BUILTIN_MODULE {
            return;
        }
        debug!(%module, %state, "module state");
        let mut screen = self.screen.lock().unwrap_or_else(PoisonError::into_inner);
        if screen.states.insert(module.to_string(), state) == Some(state) {
            return;
        }
        let line = self.render(&screen.states);
        let prefix = if self.ansi { "\r\x1b[2K" } else { "" };
        let suffix = if self.ansi { "" } else { "\n" };
        // Status output is best effort.
        let _ = write!(screen.out, "{prefix}{line}{suffix}");
        let _ = screen.out.flush();
    }
}
