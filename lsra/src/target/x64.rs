//! The x64 register file and System V calling convention.

use super::{Arch, Reg, RegMask, RepRegs, Target};

pub(crate) const RAX: Reg = Reg::new(0);
pub(crate) const RCX: Reg = Reg::new(1);
pub(crate) const RDX: Reg = Reg::new(2);
pub(crate) const RBX: Reg = Reg::new(3);
pub(crate) const RSP: Reg = Reg::new(4);
pub(crate) const RBP: Reg = Reg::new(5);
pub(crate) const RSI: Reg = Reg::new(6);
pub(crate) const RDI: Reg = Reg::new(7);
pub(crate) const R8: Reg = Reg::new(8);
pub(crate) const R9: Reg = Reg::new(9);
pub(crate) const R10: Reg = Reg::new(10);
pub(crate) const R11: Reg = Reg::new(11);
pub(crate) const R12: Reg = Reg::new(12);
pub(crate) const R13: Reg = Reg::new(13);
pub(crate) const R14: Reg = Reg::new(14);
pub(crate) const R15: Reg = Reg::new(15);
pub(crate) const XMM0: Reg = Reg::new(16);
pub(crate) const XMM1: Reg = Reg::new(17);
pub(crate) const XMM2: Reg = Reg::new(18);
pub(crate) const XMM6: Reg = Reg::new(22);
pub(crate) const XMM7: Reg = Reg::new(23);

const REG_NAMES: [&str; 32] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9",
    "xmm10", "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

const INT_ARG_REGS: [Reg; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const FLOAT_ARG_REGS: [Reg; 8] = [
    XMM0,
    XMM1,
    XMM2,
    Reg::new(19),
    Reg::new(20),
    Reg::new(21),
    XMM6,
    XMM7,
];
const INT_RET_REGS: [Reg; 2] = [RAX, RDX];
const FLOAT_RET_REGS: [Reg; 2] = [XMM0, XMM1];

const INT_REGS: RegMask = RegMask::range(0, 15);
const FLOAT_REGS: RegMask = RegMask::range(16, 31);
const INT_CALLEE_TRASH: RegMask = RegMask::from_regs(&[RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11]);

pub(crate) static TARGET: Target = Target {
    arch: Arch::X64,
    reg_names: &REG_NAMES,
    int_regs: INT_REGS,
    float_regs: FLOAT_REGS,
    // `rsp` is the stack pointer and `rbp` the frame pointer.
    allocatable_int: INT_REGS.difference(RegMask::from_regs(&[RSP, RBP])),
    allocatable_float: FLOAT_REGS,
    callee_saved: RegMask::from_regs(&[RBX, R12, R13, R14, R15]),
    callee_trash: INT_CALLEE_TRASH.union(FLOAT_REGS),
    int_arg_regs: &INT_ARG_REGS,
    float_arg_regs: &FLOAT_ARG_REGS,
    int_ret_regs: &INT_RET_REGS,
    float_ret_regs: &FLOAT_RET_REGS,
    max_ret_regs: 2,
    vsd_param_reg: R11,
    tailcall_target_reg: RAX,
    small_int_set: RegMask::from_regs(&[RAX, RCX, RBX, R12, R13]),
    small_float_set: RegMask::from_regs(&[XMM0, XMM1, XMM2, XMM6, XMM7]),
    cpblk_unroll_limit: 64,
    initblk_unroll_limit: 128,
    rep: Some((
        RepRegs {
            dst: RDI,
            src: RSI,
            init_val: RAX,
            count: RCX,
        },
        16384,
    )),
    has_swap: true,
};
