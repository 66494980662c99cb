//! Target register files and calling conventions.
//!
//! Registers are numbered densely per target (integer registers first, then floating point
//! registers) so that a [RegMask] can describe any subset of a target's register file in a single
//! `u64`. Everything target specific that the allocator needs to know about registers lives in a
//! static [Target]; everything target specific about instruction shapes lives in the lowering
//! tables (see [crate::lower]).

use std::{
    fmt,
    ops::{BitAnd, BitOr, Sub},
};
use strum::{Display, EnumCount};

pub(crate) mod aarch64;
pub(crate) mod x64;

/// A physical register on a [Target].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Reg(u8);

impl Reg {
    pub const fn new(n: u8) -> Self {
        assert!(n < 64);
        Self(n)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }
}

impl index_vec::Idx for Reg {
    fn from_usize(idx: usize) -> Self {
        // `IndexVec` converts its length, so a full 64 register file needs `Reg(64)`.
        assert!(idx <= 64);
        Reg(u8::try_from(idx).unwrap())
    }

    fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A set of registers.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct RegMask(u64);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn from_regs(regs: &[Reg]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < regs.len() {
            bits |= 1 << regs[i].0;
            i += 1;
        }
        Self(bits)
    }

    /// The registers numbered `first..=last`.
    pub const fn range(first: u8, last: u8) -> Self {
        assert!(first <= last && last < 64);
        let len = last - first + 1;
        let bits = if len == 64 {
            u64::MAX
        } else {
            ((1u64 << len) - 1) << first
        };
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn union(self, other: RegMask) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: RegMask) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        usize::try_from(self.0.count_ones()).unwrap()
    }

    pub fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    pub fn with(self, reg: Reg) -> Self {
        Self(self.0 | (1 << reg.0))
    }

    pub fn without(self, reg: Reg) -> Self {
        Self(self.0 & !(1 << reg.0))
    }

    /// If this mask contains exactly one register, return it.
    pub fn single(self) -> Option<Reg> {
        if self.0.count_ones() == 1 {
            Some(Reg(u8::try_from(self.0.trailing_zeros()).unwrap()))
        } else {
            None
        }
    }

    pub fn first(self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            Some(Reg(u8::try_from(self.0.trailing_zeros()).unwrap()))
        }
    }

    /// Iterate over the registers in this mask in ascending order.
    pub fn iter(self) -> impl Iterator<Item = Reg> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let n = bits.trailing_zeros();
                bits &= bits - 1;
                Some(Reg(u8::try_from(n).unwrap()))
            }
        })
    }
}

impl BitOr for RegMask {
    type Output = RegMask;

    fn bitor(self, rhs: RegMask) -> RegMask {
        self.union(rhs)
    }
}

impl BitAnd for RegMask {
    type Output = RegMask;

    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl Sub for RegMask {
    type Output = RegMask;

    fn sub(self, rhs: RegMask) -> RegMask {
        self.difference(rhs)
    }
}

impl From<Reg> for RegMask {
    fn from(reg: Reg) -> Self {
        RegMask(1 << reg.0)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegMask({:#x})", self.0)
    }
}

#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, Hash, PartialEq)]
pub enum RegClass {
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "float")]
    Float,
}

#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Arch {
    #[strum(serialize = "x64")]
    X64,
    #[strum(serialize = "arm64")]
    Arm64,
}

/// The fixed registers used by a `rep movs` / `rep stos` style block operation.
#[derive(Debug)]
pub struct RepRegs {
    pub dst: Reg,
    pub src: Reg,
    pub init_val: Reg,
    pub count: Reg,
}

/// Everything the allocator needs to know about a target's register file and calling convention.
#[derive(Debug)]
pub struct Target {
    pub arch: Arch,
    pub reg_names: &'static [&'static str],
    /// Every integer register, whether allocatable or not.
    pub int_regs: RegMask,
    /// Every floating point register, whether allocatable or not.
    pub float_regs: RegMask,
    pub allocatable_int: RegMask,
    pub allocatable_float: RegMask,
    pub callee_saved: RegMask,
    /// The registers a normal call clobbers.
    pub callee_trash: RegMask,
    pub int_arg_regs: &'static [Reg],
    pub float_arg_regs: &'static [Reg],
    pub int_ret_regs: &'static [Reg],
    pub float_ret_regs: &'static [Reg],
    /// The maximum number of registers a single node can define.
    pub max_ret_regs: usize,
    /// The register carrying the indirection cell of a virtual stub dispatch call.
    pub vsd_param_reg: Reg,
    /// The register holding the target of a fast tail call.
    pub tailcall_target_reg: Reg,
    pub small_int_set: RegMask,
    pub small_float_set: RegMask,
    pub cpblk_unroll_limit: u32,
    pub initblk_unroll_limit: u32,
    /// If the target has a repeat-prefixed block primitive: the registers it uses and the
    /// largest constant size we will use it for.
    pub rep: Option<(RepRegs, u32)>,
    /// Does the target have a register-register exchange for integer registers?
    pub has_swap: bool,
}

impl Target {
    pub fn for_arch(arch: Arch) -> &'static Target {
        match arch {
            Arch::X64 => &x64::TARGET,
            Arch::Arm64 => &aarch64::TARGET,
        }
    }

    pub fn reg_name(&self, reg: Reg) -> &'static str {
        self.reg_names[usize::from(reg.raw())]
    }

    pub fn reg_from_name(&self, name: &str) -> Option<Reg> {
        self.reg_names
            .iter()
            .position(|x| *x == name)
            .map(|x| Reg::new(u8::try_from(x).unwrap()))
    }

    pub fn reg_class(&self, reg: Reg) -> RegClass {
        if self.float_regs.contains(reg) {
            RegClass::Float
        } else {
            assert!(self.int_regs.contains(reg));
            RegClass::Int
        }
    }

    /// Every register, allocatable or not, of `class`.
    pub fn class_regs(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.int_regs,
            RegClass::Float => self.float_regs,
        }
    }

    pub fn allocatable(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.allocatable_int,
            RegClass::Float => self.allocatable_float,
        }
    }

    pub fn small_set(&self, class: RegClass) -> RegMask {
        match class {
            RegClass::Int => self.small_int_set,
            RegClass::Float => self.small_float_set,
        }
    }

    pub fn arg_regs(&self, class: RegClass) -> &'static [Reg] {
        match class {
            RegClass::Int => self.int_arg_regs,
            RegClass::Float => self.float_arg_regs,
        }
    }

    pub fn ret_regs(&self, class: RegClass) -> &'static [Reg] {
        match class {
            RegClass::Int => self.int_ret_regs,
            RegClass::Float => self.float_ret_regs,
        }
    }

    /// Format `mask` as `{r1, r2, ...}`.
    pub fn fmt_mask(&self, mask: RegMask) -> String {
        format!(
            "{{{}}}",
            mask.iter()
                .map(|x| self.reg_name(x))
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
