//! Allocator configuration.
//!
//! A [Config] names the target architecture and carries the diagnostic / stress toggles used to
//! test the allocator under adversarial register pressure. The stress toggles mirror the
//! `LSRA_STRESS` bit layout:
//!
//! | bits    | meaning                                                   |
//! |---------|-----------------------------------------------------------|
//! | `0x3`   | limit registers: 1 = callee saved, 2 = caller saved, 3 = small set |
//! | `0x4`   | reverse the free register selection heuristics            |
//! | `0x8`   | reverse the callee/caller saved preference                |
//! | `0x10`  | prefer the register whose next fixed reference is nearest |
//! | `0x60`  | block traversal: `0x20` = layout, `0x40` = predecessor first (default) |
//! | `0x80`  | extend the lifetimes of locals to their block boundaries  |
//! | `0x300` | block entry locations: 0 = best predecessor, `0x100` = layout predecessor, `0x200` = rotate |
//! | `0x400` | always reload spilled values, even for reg-optional uses  |
//! | `0x800` | spill every value after every definition                  |
//! | `0x1000`| never allocate registers to reg-optional uses             |

use crate::target::{Arch, RegMask};
use std::{env, error::Error};

/// The largest number of spill temps of any one kind a method may use.
pub const DEFAULT_MAX_SPILL_SLOTS: usize = 1024;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LimitRegs {
    #[default]
    None,
    Callee,
    Caller,
    SmallSet,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Traversal {
    Layout,
    #[default]
    PredFirst,
}

/// How the incoming locations of a block's live-in locals are chosen.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BlockBoundary {
    /// The allocated predecessor with the highest weight.
    #[default]
    Pred,
    /// The previous block in layout order if it is an allocated predecessor.
    Layout,
    /// Cycle through the allocated predecessors.
    Rotate,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Stress {
    pub limit: LimitRegs,
    pub reverse_heuristics: bool,
    pub reverse_caller_callee: bool,
    pub select_nearest: bool,
    pub traversal: Traversal,
    pub extend_lifetimes: bool,
    pub block_boundary: BlockBoundary,
    pub always_insert_reload: bool,
    pub spill_always: bool,
    pub reg_optional_no_alloc: bool,
}

const LIMIT_MASK: u32 = 0x3;
const REVERSE_HEURISTICS: u32 = 0x4;
const REVERSE_CALLER_CALLEE: u32 = 0x8;
const SELECT_NEAREST: u32 = 0x10;
const TRAVERSE_LAYOUT: u32 = 0x20;
const TRAVERSE_PRED_FIRST: u32 = 0x40;
const EXTEND_LIFETIMES: u32 = 0x80;
const BLOCK_BOUNDARY_LAYOUT: u32 = 0x100;
const BLOCK_BOUNDARY_ROTATE: u32 = 0x200;
const ALWAYS_INSERT_RELOAD: u32 = 0x400;
const SPILL_ALWAYS: u32 = 0x800;
const REG_OPTIONAL_NO_ALLOC: u32 = 0x1000;
const VALID_BITS: u32 = 0x1fff;

impl Stress {
    pub fn from_bits(bits: u32) -> Result<Self, Box<dyn Error>> {
        if bits & !VALID_BITS != 0 {
            return Err(format!("Invalid stress bits {:#x}", bits & !VALID_BITS).into());
        }
        let limit = match bits & LIMIT_MASK {
            0 => LimitRegs::None,
            1 => LimitRegs::Callee,
            2 => LimitRegs::Caller,
            _ => LimitRegs::SmallSet,
        };
        let traversal = match bits & (TRAVERSE_LAYOUT | TRAVERSE_PRED_FIRST) {
            TRAVERSE_LAYOUT => Traversal::Layout,
            0 | TRAVERSE_PRED_FIRST => Traversal::PredFirst,
            _ => return Err("Only one traversal order may be specified".into()),
        };
        let block_boundary = match bits & (BLOCK_BOUNDARY_LAYOUT | BLOCK_BOUNDARY_ROTATE) {
            0 => BlockBoundary::Pred,
            BLOCK_BOUNDARY_LAYOUT => BlockBoundary::Layout,
            BLOCK_BOUNDARY_ROTATE => BlockBoundary::Rotate,
            _ => return Err("Only one block boundary policy may be specified".into()),
        };
        Ok(Self {
            limit,
            reverse_heuristics: bits & REVERSE_HEURISTICS != 0,
            reverse_caller_callee: bits & REVERSE_CALLER_CALLEE != 0,
            select_nearest: bits & SELECT_NEAREST != 0,
            traversal,
            extend_lifetimes: bits & EXTEND_LIFETIMES != 0,
            block_boundary,
            always_insert_reload: bits & ALWAYS_INSERT_RELOAD != 0,
            spill_always: bits & SPILL_ALWAYS != 0,
            reg_optional_no_alloc: bits & REG_OPTIONAL_NO_ALLOC != 0,
        })
    }

    pub fn bits(&self) -> u32 {
        let mut bits = match self.limit {
            LimitRegs::None => 0,
            LimitRegs::Callee => 1,
            LimitRegs::Caller => 2,
            LimitRegs::SmallSet => 3,
        };
        let flags = [
            (self.reverse_heuristics, REVERSE_HEURISTICS),
            (self.reverse_caller_callee, REVERSE_CALLER_CALLEE),
            (self.select_nearest, SELECT_NEAREST),
            (self.traversal == Traversal::Layout, TRAVERSE_LAYOUT),
            (self.extend_lifetimes, EXTEND_LIFETIMES),
            (self.block_boundary == BlockBoundary::Layout, BLOCK_BOUNDARY_LAYOUT),
            (self.block_boundary == BlockBoundary::Rotate, BLOCK_BOUNDARY_ROTATE),
            (self.always_insert_reload, ALWAYS_INSERT_RELOAD),
            (self.spill_always, SPILL_ALWAYS),
            (self.reg_optional_no_alloc, REG_OPTIONAL_NO_ALLOC),
        ];
        for (set, bit) in flags {
            if set {
                bits |= bit;
            }
        }
        bits
    }

    pub fn is_enabled(&self) -> bool {
        *self != Self::default()
    }
}

/// Parse a stress mask as either `0x`-prefixed hex or decimal.
fn parse_stress(s: &str) -> Result<Stress, Box<dyn Error>> {
    let bits = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    }
    .map_err(|e| format!("Invalid LSRA_STRESS value '{s}': {e}"))?;
    Stress::from_bits(bits)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub arch: Arch,
    pub stress: Stress,
    /// Restrict non-fixed register candidates to this set. Fixed register references are never
    /// restricted.
    pub reg_limit: Option<RegMask>,
    /// Check the allocation after resolution.
    pub verify: bool,
    /// The most spill temps of any one [crate::nodeinfo::SlotKind] a method may use.
    pub max_spill_slots: usize,
}

impl Config {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            stress: Stress::default(),
            reg_limit: None,
            verify: cfg!(debug_assertions),
            max_spill_slots: DEFAULT_MAX_SPILL_SLOTS,
        }
    }

    /// Create a [Config] for `arch`, overriding defaults from the `LSRA_STRESS` and `LSRA_VERIFY`
    /// environment variables.
    pub fn from_env(arch: Arch) -> Result<Self, Box<dyn Error>> {
        let mut config = Self::new(arch);
        if let Ok(s) = env::var("LSRA_STRESS") {
            config.stress = parse_stress(&s)?;
        }
        match env::var("LSRA_VERIFY").as_deref() {
            Ok("0") => config.verify = false,
            Ok("1") => config.verify = true,
            Ok(x) => return Err(format!("Invalid LSRA_VERIFY value '{x}'").into()),
            Err(_) => (),
        }
        Ok(config)
    }

    pub fn with_stress(mut self, stress: Stress) -> Self {
        self.stress = stress;
        self
    }

    pub fn with_reg_limit(mut self, mask: RegMask) -> Self {
        self.reg_limit = Some(mask);
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }
}
