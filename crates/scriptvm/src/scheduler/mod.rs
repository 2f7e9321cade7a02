// SPDX-License-Identifier: MIT

//! Process spawning, the driver tick, and signal primitives.
//!
//! The VM drives many processes cooperatively: each tick, every process
//! still in [`ProcessState::Running`] gets to run until it yields a frame,
//! finishes, or hits a re-entrant call boundary (the host is expected to
//! have already resolved any boundary before the next tick runs — see
//! [`crate::host`]). [`Vm::tick`] is the whole-VM driver a host's game loop
//! calls once per frame; [`Vm::signal`] is how it asks a process, a whole
//! blueprint's population, or every process to freeze, hide, resume, or
//! die.

#[cfg(test)]
mod mod_test;

use crate::process::ProcessState;
use crate::value::{ProcessDefId, ProcessId, Value};
use crate::vm::{ProcessOutcome, Vm};

/// What happened when a process was driven during a [`Vm::tick`].
#[derive(Debug, Clone)]
pub enum TickOutcome {
    /// The process executed `OP_FRAME`, carrying the driver hint integer.
    Frame(i64),
    /// The process finished (root frame returned, or `OP_EXIT`/`OP_HALT`),
    /// carrying its return or exit value.
    Done(Value),
    /// The process faulted on a [`crate::FatalError`] and was killed.
    Faulted(String),
}

/// One process's result for a single [`Vm::tick`] call.
#[derive(Debug, Clone)]
pub struct TickEvent {
    pub process: ProcessId,
    pub outcome: TickOutcome,
}

/// Selects which processes a [`Vm::signal`] call targets.
#[derive(Debug, Clone, Copy)]
pub enum SignalTarget {
    Process(ProcessId),
    Blueprint(ProcessDefId),
    All,
}

/// A lifecycle request a host (or a script's own `signal` built-in) can
/// make of one or more processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Freeze,
    /// The reference implementation maps `s_hide` onto the same frozen
    /// state `s_freeze` uses — there is no separate "invisible but still
    /// running" state at the core level. A graphics binding that needs
    /// draw-without-run or run-without-draw can track visibility in a
    /// private slot instead.
    Hide,
    Show,
}

impl Vm {
    /// Run every schedulable process once, in table order, then reap
    /// anything that died this tick (firing `on_destroy` for each).
    ///
    /// Dead processes are removed with a stable `retain`, not
    /// `swap_remove`, so a [`ProcessId`] stays the right way to refer to a
    /// process across ticks — table position never is.
    pub fn tick(&mut self) -> Vec<TickEvent> {
        let mut events = Vec::new();
        let mut idx = 0;
        while idx < self.processes.len() {
            if !self.processes[idx].is_schedulable() {
                idx += 1;
                continue;
            }
            let pid = self.processes[idx].id;
            match self.run_process(idx) {
                Ok(ProcessOutcome::Frame(hint)) => {
                    events.push(TickEvent {
                        process: pid,
                        outcome: TickOutcome::Frame(hint),
                    });
                }
                Ok(ProcessOutcome::Done(value)) => {
                    if let Some(pidx) = self.find_process_index(pid) {
                        self.processes[pidx].state = ProcessState::Dead;
                    }
                    events.push(TickEvent {
                        process: pid,
                        outcome: TickOutcome::Done(value),
                    });
                }
                Ok(ProcessOutcome::CallReturn(_)) => {
                    // A call boundary firing here means a native callback
                    // re-entered the interpreter outside of
                    // `Vm::call_function`/`call_method`/`call_process`;
                    // there is nothing for the tick driver to do with it.
                }
                Err(err) => {
                    if let Some(pidx) = self.find_process_index(pid) {
                        self.processes[pidx].state = ProcessState::Dead;
                    }
                    events.push(TickEvent {
                        process: pid,
                        outcome: TickOutcome::Faulted(err.to_string()),
                    });
                }
            }
            idx += 1;
        }
        self.reap_dead();
        events
    }

    /// Remove every dead process and fire `on_destroy` for each.
    fn reap_dead(&mut self) {
        let dead: Vec<(ProcessId, i32)> = self
            .processes
            .iter()
            .filter(|p| p.state == ProcessState::Dead)
            .map(|p| (p.id, p.exit_code))
            .collect();
        if dead.is_empty() {
            return;
        }
        self.processes.retain(|p| p.state != ProcessState::Dead);
        if let Some(hook) = self.hooks.on_destroy {
            for (pid, code) in dead {
                hook(self, pid, code);
            }
        }
    }

    /// Apply `signal` to every process `target` selects. A `Kill` reaps
    /// the affected processes immediately rather than waiting for the next
    /// `tick`.
    pub fn signal(&mut self, target: SignalTarget, signal: Signal) {
        for idx in 0..self.processes.len() {
            let matches_target = match target {
                SignalTarget::Process(pid) => self.processes[idx].id == pid,
                SignalTarget::Blueprint(def_id) => self.processes[idx].blueprint == def_id,
                SignalTarget::All => true,
            };
            if !matches_target || !self.processes[idx].is_alive() {
                continue;
            }
            self.processes[idx].state = match signal {
                Signal::Kill => ProcessState::Dead,
                Signal::Freeze | Signal::Hide => ProcessState::Frozen,
                Signal::Show => ProcessState::Running,
            };
        }
        if signal == Signal::Kill {
            self.reap_dead();
        }
    }

    /// Every live process id whose blueprint is `def_id`, or every live
    /// process id at all when `def_id` is `None`.
    #[must_use]
    pub fn get_ids(&self, def_id: Option<ProcessDefId>) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|p| p.is_alive() && def_id.map_or(true, |d| p.blueprint == d))
            .map(|p| p.id)
            .collect()
    }

    #[must_use]
    pub fn count_processes(&self, def_id: Option<ProcessDefId>) -> usize {
        self.processes
            .iter()
            .filter(|p| p.is_alive() && def_id.map_or(true, |d| p.blueprint == d))
            .count()
    }

    #[must_use]
    pub fn exists(&self, id: ProcessId) -> bool {
        self.find_process(id).map_or(false, crate::process::Process::is_alive)
    }
}
