//! A linear scan register allocator for a method JIT.
//!
//! [compile_method] takes a [Method] through the allocator's phases:
//!
//! 1. [lower]: rewrite nodes into shapes the target can realise directly and describe each node's
//!    register requirements in a [NodeInfo](nodeinfo::NodeInfo).
//! 2. [regalloc]: linearise the method into reference positions, assign registers and spill
//!    locations, reconcile assignments at block boundaries, and write the final assignments back
//!    onto each node's [NodeInfo](nodeinfo::NodeInfo) for code emission.
//!
//! The allocator is configured by a [Config]. Logging and statistics are configured by the
//! `LSRA_LOG`, `LSRA_LOG_IR` (with the `lsrad` feature), and `LSRA_LOG_STATS` environment
//! variables.

#![allow(clippy::new_without_default)]
#![allow(clippy::type_complexity)]

use std::{error::Error, time::Instant};
use thiserror::Error;

pub mod config;
pub mod ir;
mod log;
mod lower;
pub mod nodeinfo;
pub mod regalloc;
pub mod target;

pub use config::Config;
pub use log::stats::{AllocStats, Stat};
use ir::Method;
use log::{IRPhase, Verbosity, log, log_ir, should_log_ir, stats::stats};
use nodeinfo::NodeInfos;
use regalloc::Allocation;
use target::Target;

#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("Internal error: {0}")]
    /// Something went wrong that is probably the result of a bug in the allocator.
    InternalError(String),
    #[error("Unsupported: {0}")]
    /// The method uses an operation that has no lowering on the target.
    Unsupported(String),
    #[error("Limit exceeded: {0}")]
    /// A fixed limit of the target was exceeded, e.g. a value needs more return registers than
    /// there are.
    LimitExceeded(String),
    #[error("Resource exhausted: {0:}")]
    /// A finite resource (e.g. spill slots) was exhausted.
    ResourceExhausted(Box<dyn Error>),
}

/// A method whose nodes have been lowered and assigned registers.
#[derive(Debug)]
pub struct CompiledMethod {
    /// Each node's register requirements and allocation.
    pub infos: NodeInfos,
    pub alloc: Allocation,
}

/// Lower and allocate registers for `m`, which is modified in place: lowering rewrites nodes, and
/// resolution inserts moves and splits critical edges.
pub fn compile_method(m: &mut Method, config: &Config) -> Result<CompiledMethod, CompilationError> {
    let start = Instant::now();
    match compile(m, config) {
        Ok(cm) => {
            stats().method_compiled_ok(&cm.alloc.stats, start.elapsed());
            log().log(
                Verbosity::MethodEvent,
                &format!("compiled '{}' for {}", m.name, config.arch),
            );
            Ok(cm)
        }
        Err(e) => {
            stats().method_compiled_err(start.elapsed());
            log().log(
                Verbosity::Warning,
                &format!("compiling '{}' failed: {e}", m.name),
            );
            Err(e)
        }
    }
}

fn compile(m: &mut Method, config: &Config) -> Result<CompiledMethod, CompilationError> {
    m.assert_well_formed();
    log().log(
        Verbosity::MethodEvent,
        &format!("compiling '{}' for {}", m.name, config.arch),
    );
    let target = Target::for_arch(config.arch);
    if should_log_ir(IRPhase::Input) {
        log_ir(&format!("--- Begin input: {} ---\n{m}--- End input ---\n", m.name));
    }
    let mut infos = lower::lower(m, target)?;
    if should_log_ir(IRPhase::Lowered) {
        log_ir(&format!(
            "--- Begin lowered: {} ---\n{}--- End lowered ---\n",
            m.name,
            m.display(Some(target), Some(&infos))
        ));
    }
    let alloc = regalloc::allocate(m, &mut infos, target, config)?;
    if should_log_ir(IRPhase::Allocated) {
        log_ir(&format!(
            "--- Begin allocated: {} ---\n{}--- End allocated ---\n",
            m.name,
            m.display(Some(target), Some(&infos))
        ));
    }
    Ok(CompiledMethod { infos, alloc })
}

/// If `LSRA_LOG_STATS` is set, write the statistics aggregated over every method compiled so far.
pub fn output_stats() {
    stats().output();
}
