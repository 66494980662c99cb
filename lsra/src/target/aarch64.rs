//! The arm64 register file and AAPCS64 calling convention.

use super::{Arch, Reg, RegMask, Target};

pub(crate) const X0: Reg = Reg::new(0);
pub(crate) const X1: Reg = Reg::new(1);
pub(crate) const X2: Reg = Reg::new(2);
pub(crate) const X3: Reg = Reg::new(3);
pub(crate) const X4: Reg = Reg::new(4);
pub(crate) const X5: Reg = Reg::new(5);
pub(crate) const X6: Reg = Reg::new(6);
pub(crate) const X7: Reg = Reg::new(7);
pub(crate) const X11: Reg = Reg::new(11);
/// `ip0`: the intra-procedure-call scratch register, never allocated.
pub(crate) const X16: Reg = Reg::new(16);
pub(crate) const X19: Reg = Reg::new(19);
pub(crate) const X20: Reg = Reg::new(20);
pub(crate) const V0: Reg = Reg::new(32);
pub(crate) const V1: Reg = Reg::new(33);
pub(crate) const V2: Reg = Reg::new(34);
pub(crate) const V3: Reg = Reg::new(35);
pub(crate) const V8: Reg = Reg::new(40);
pub(crate) const V9: Reg = Reg::new(41);

const REG_NAMES: [&str; 64] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "v0", "v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8", "v9", "v10",
    "v11", "v12", "v13", "v14", "v15", "v16", "v17", "v18", "v19", "v20", "v21", "v22", "v23",
    "v24", "v25", "v26", "v27", "v28", "v29", "v30", "v31",
];

const INT_ARG_REGS: [Reg; 8] = [X0, X1, X2, X3, X4, X5, X6, X7];
const FLOAT_ARG_REGS: [Reg; 8] = [
    V0,
    V1,
    V2,
    V3,
    Reg::new(36),
    Reg::new(37),
    Reg::new(38),
    Reg::new(39),
];
const INT_RET_REGS: [Reg; 2] = [X0, X1];
const FLOAT_RET_REGS: [Reg; 4] = [V0, V1, V2, V3];

const INT_REGS: RegMask = RegMask::range(0, 31);
const FLOAT_REGS: RegMask = RegMask::range(32, 63);
/// `x0`-`x17` and `lr`.
const INT_CALLEE_TRASH: RegMask = RegMask::range(0, 17).union(RegMask::range(30, 30));
const FLOAT_CALLEE_SAVED: RegMask = RegMask::range(40, 47);

pub(crate) static TARGET: Target = Target {
    arch: Arch::Arm64,
    reg_names: &REG_NAMES,
    int_regs: INT_REGS,
    float_regs: FLOAT_REGS,
    // `x16`/`x17` are linker scratch registers, `x18` is the platform register, and `fp`, `lr`
    // and `sp` are never allocated.
    allocatable_int: RegMask::range(0, 15).union(RegMask::range(19, 28)),
    allocatable_float: FLOAT_REGS,
    callee_saved: RegMask::range(19, 28).union(FLOAT_CALLEE_SAVED),
    callee_trash: INT_CALLEE_TRASH.union(FLOAT_REGS.difference(FLOAT_CALLEE_SAVED)),
    int_arg_regs: &INT_ARG_REGS,
    float_arg_regs: &FLOAT_ARG_REGS,
    int_ret_regs: &INT_RET_REGS,
    float_ret_regs: &FLOAT_RET_REGS,
    max_ret_regs: 4,
    vsd_param_reg: X11,
    tailcall_target_reg: X16,
    small_int_set: RegMask::from_regs(&[X0, X1, X2, X19, X20]),
    small_float_set: RegMask::from_regs(&[V0, V1, V2, V8, V9]),
    cpblk_unroll_limit: 64,
    initblk_unroll_limit: 64,
    rep: None,
    has_swap: false,
};
