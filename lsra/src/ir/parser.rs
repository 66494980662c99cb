//! A parser for the textual form of the IR (see [super]), suitable for creating [Method]s for
//! testing purposes.
//!
//! The input is the output of [Method]'s `Display` implementation with the following
//! differences:
//!
//! 1. Node names (`%n`) are labels: they need not be contiguous or ordered, but each may only be
//!    defined once and must be defined before it is used.
//! 2. Only nodes the IR builder can produce are accepted: `lea`, `putarg_*`, `move`, and `swap`
//!    are produced by lowering or allocation and are rejected.
//! 3. Blocks are numbered in the order they appear; the first block is the entry block.
//! 4. Anything after a `;` on a line is a comment.

use super::{
    BinOp, BlkOp, BlkSize, BlockIdx, CallTarget, LclIdx, Local, Method, NodeIdx, NodeKind, Pred,
    Ty, UnOp,
};
use lrlex::{DefaultLexerTypes, LRNonStreamingLexer, lrlex_mod};
use lrpar::{NonStreamingLexer, Span, lrpar_mod};
use smallvec::SmallVec;
use std::collections::HashMap;
use strum::IntoEnumIterator;

lrlex_mod!("ir/ir.l");
lrpar_mod!("ir/ir.y");
type StorageT = u32;

pub(crate) struct AstLocal {
    pub(crate) name: Span,
    pub(crate) ty: AstTy,
    pub(crate) param: Option<Span>,
    pub(crate) exposed: bool,
}

pub(crate) struct AstTy {
    pub(crate) name: Span,
    pub(crate) size: Option<Span>,
    pub(crate) gc: Option<Span>,
}

pub(crate) struct AstBlock {
    pub(crate) label: Span,
    pub(crate) weight: Option<Span>,
    pub(crate) succs: Vec<Span>,
    pub(crate) insts: Vec<AstInst>,
}

pub(crate) struct AstInst {
    pub(crate) def: Option<(Span, AstTy)>,
    pub(crate) op: Span,
    pub(crate) operands: Vec<AstOperand>,
}

pub(crate) enum AstOperand {
    Node(Span),
    Local(Span),
    Int(Span),
    Float(Span),
    Call {
        target: AstCallTarget,
        args: Vec<Span>,
    },
}

pub(crate) enum AstCallTarget {
    Direct(Span),
    Indirect(Span),
}

struct IrParser<'lexer, 'input: 'lexer> {
    lexer: &'lexer LRNonStreamingLexer<'lexer, 'input, DefaultLexerTypes<StorageT>>,
    m: Method,
    lcls: HashMap<&'input str, LclIdx>,
    blocks: HashMap<&'input str, BlockIdx>,
    nodes: HashMap<&'input str, NodeIdx>,
}

impl<'lexer, 'input: 'lexer> IrParser<'lexer, 'input> {
    fn build(mut self, astlcls: Vec<AstLocal>, astblocks: Vec<AstBlock>) -> Method {
        for AstLocal {
            name,
            ty,
            param,
            exposed,
        } in astlcls
        {
            let s = &self.lexer.span_str(name)[1..];
            let ty = self.p_ty(ty);
            let param = param.map(|x| self.p_int::<u32>(x));
            let lidx = self.m.push_local(Local {
                name: s.to_owned(),
                ty,
                param,
                exposed,
            });
            if self.lcls.insert(self.lexer.span_str(name), lidx).is_some() {
                self.err_span(name, "Duplicate local");
            }
        }

        for b in &astblocks {
            let weight = b.weight.map(|x| self.p_int::<u32>(x)).unwrap_or(1);
            let bidx = self.m.push_block(weight);
            if self.blocks.insert(self.lexer.span_str(b.label), bidx).is_some() {
                self.err_span(b.label, "Duplicate block");
            }
        }

        for (bidx, AstBlock { succs, insts, .. }) in astblocks.into_iter().enumerate() {
            let bidx = BlockIdx::new(bidx);
            for span in succs {
                let succ = self.p_block(span);
                self.m.add_edge(bidx, succ);
            }
            for inst in insts {
                self.p_inst(bidx, inst);
            }
        }

        self.m.assert_well_formed();
        self.m
    }

    fn p_inst(&mut self, bidx: BlockIdx, AstInst { def, op, operands }: AstInst) {
        let opname = self.lexer.span_str(op);
        let mut parts = opname.split('.');
        let base = parts.next().unwrap();
        let flags = parts.collect::<Vec<_>>();
        let ty = match &def {
            Some((_, astty)) => self.p_ty(AstTy {
                name: astty.name,
                size: astty.size,
                gc: astty.gc,
            }),
            None => Ty::Void,
        };
        let check_flags = |this: &Self, allowed: &[&str]| {
            for f in &flags {
                if !allowed.contains(f) {
                    this.err_span(op, &format!("Unknown flag '{f}'"));
                }
            }
        };
        let has = |f: &str| flags.contains(&f);

        let kind = match (base, operands.as_slice()) {
            ("const", [AstOperand::Int(x)]) if !ty.is_float() => {
                check_flags(self, &[]);
                NodeKind::Const(self.p_int::<i64>(*x))
            }
            ("const", [AstOperand::Int(x) | AstOperand::Float(x)]) if ty.is_float() => {
                check_flags(self, &[]);
                let s = self.lexer.span_str(*x);
                NodeKind::ConstDbl(
                    s.parse::<f64>()
                        .unwrap_or_else(|e| self.err_span(*x, &e.to_string())),
                )
            }
            ("lcl", [AstOperand::Local(x)]) => NodeKind::Lcl(self.p_lcl(*x)),
            ("lcladdr", [AstOperand::Local(x)]) => NodeKind::LclAddr(self.p_lcl(*x)),
            ("stlcl", [AstOperand::Local(l), AstOperand::Node(v)]) => NodeKind::StoreLcl {
                lcl: self.p_lcl(*l),
                val: self.p_node(*v),
            },
            ("neg" | "not", [AstOperand::Node(x)]) => NodeKind::UnOp {
                op: if base == "neg" { UnOp::Neg } else { UnOp::Not },
                val: self.p_node(*x),
            },
            ("jtrue", [AstOperand::Node(x)]) => NodeKind::JTrue(self.p_node(*x)),
            ("load", [AstOperand::Node(x)]) => NodeKind::Load(self.p_node(*x)),
            ("store", [AstOperand::Node(a), AstOperand::Node(v)]) => NodeKind::Store {
                addr: self.p_node(*a),
                val: self.p_node(*v),
            },
            ("cast", [AstOperand::Node(x)]) => {
                check_flags(self, &["u", "ovf"]);
                NodeKind::Cast {
                    val: self.p_node(*x),
                    unsigned: has("u"),
                    ovf: has("ovf"),
                }
            }
            ("call" | "vcall", [AstOperand::Call { target, args }]) => {
                check_flags(self, &["tail"]);
                let args = args
                    .iter()
                    .map(|x| self.p_node(*x))
                    .collect::<SmallVec<_>>();
                let target = match (base, target) {
                    ("call", AstCallTarget::Direct(x)) => {
                        CallTarget::Direct(self.lexer.span_str(*x)[1..].to_owned())
                    }
                    ("call", AstCallTarget::Indirect(x)) => CallTarget::Indirect(self.p_node(*x)),
                    ("vcall", AstCallTarget::Indirect(x)) => {
                        CallTarget::VirtualStub(self.p_node(*x))
                    }
                    _ => self.err_span(op, "Virtual stub calls must be indirect"),
                };
                NodeKind::Call {
                    target,
                    args,
                    tail: has("tail"),
                }
            }
            (
                "copyblk" | "initblk",
                [AstOperand::Node(d), AstOperand::Node(s), size],
            ) => {
                check_flags(self, &["gc"]);
                let size = match size {
                    AstOperand::Int(x) => BlkSize::Const(self.p_int::<u32>(*x)),
                    AstOperand::Node(x) => BlkSize::Dyn(self.p_node(*x)),
                    _ => self.err_span(op, "Block op sizes must be constants or nodes"),
                };
                NodeKind::Blk {
                    op: if base == "copyblk" {
                        BlkOp::Copy
                    } else {
                        BlkOp::Init
                    },
                    dst: self.p_node(*d),
                    src: self.p_node(*s),
                    size,
                    gc: has("gc"),
                }
            }
            ("ret", []) => NodeKind::Return(None),
            ("ret", [AstOperand::Node(x)]) => NodeKind::Return(Some(self.p_node(*x))),
            ("nop", []) => NodeKind::Nop,
            (_, [AstOperand::Node(lhs), AstOperand::Node(rhs)]) => {
                let (lhs, rhs) = (self.p_node(*lhs), self.p_node(*rhs));
                if let Some(op) = BinOp::iter().find(|x| x.to_string() == base) {
                    NodeKind::BinOp { op, lhs, rhs }
                } else if let Some(pred) = Pred::iter().find(|x| x.to_string() == base) {
                    NodeKind::Cmp { pred, lhs, rhs }
                } else {
                    self.err_span(op, &format!("Unknown operation '{opname}'"))
                }
            }
            _ => self.err_span(op, &format!("Unknown operation or operands '{opname}'")),
        };
        if !matches!(base, "cast" | "call" | "vcall" | "copyblk" | "initblk") && !flags.is_empty()
        {
            self.err_span(op, &format!("'{base}' does not take flags"));
        }

        let nidx = self.m.push_node(bidx, ty, kind);
        if let Some((span, _)) = def {
            let s = self.lexer.span_str(span);
            if self.nodes.insert(&s[..s.len() - 1], nidx).is_some() {
                self.err_span(span, "Duplicate node");
            }
        }
    }

    fn p_int<T>(&self, span: Span) -> T
    where
        T: std::str::FromStr + TryFrom<u64>,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        let s = self.lexer.span_str(span);
        if let Some(hex) = s.strip_prefix("0x") {
            let x = u64::from_str_radix(hex, 16)
                .unwrap_or_else(|e| self.err_span(span, &e.to_string()));
            T::try_from(x).unwrap_or_else(|_| self.err_span(span, "Value out of range"))
        } else {
            s.parse::<T>()
                .unwrap_or_else(|e| self.err_span(span, &e.to_string()))
        }
    }

    fn p_ty(&self, AstTy { name, size, gc }: AstTy) -> Ty {
        let s = self.lexer.span_str(name);
        match (s, size, gc) {
            ("void", None, None) => Ty::Void,
            ("ptr", None, None) => Ty::Ptr,
            ("ref", None, None) => Ty::Ref,
            ("f32", None, None) => Ty::Float,
            ("f64", None, None) => Ty::Double,
            ("struct", Some(size), gc) => {
                if let Some(gc) = gc {
                    if self.lexer.span_str(gc) != "gc" {
                        self.err_span(gc, "Expected 'gc'");
                    }
                }
                Ty::Struct {
                    size: self.p_int::<u32>(size),
                    gc: gc.is_some(),
                }
            }
            (_, None, None) if s.starts_with('i') => match s[1..].parse::<u32>() {
                Ok(bitw @ (8 | 16 | 32 | 64)) => Ty::Int(bitw),
                _ => self.err_span(name, "Integer types must be i8, i16, i32, or i64"),
            },
            _ => self.err_span(name, &format!("Unknown type '{s}'")),
        }
    }

    fn p_lcl(&self, span: Span) -> LclIdx {
        *self
            .lcls
            .get(self.lexer.span_str(span))
            .unwrap_or_else(|| self.err_span(span, "Unknown local"))
    }

    fn p_block(&self, span: Span) -> BlockIdx {
        *self
            .blocks
            .get(self.lexer.span_str(span))
            .unwrap_or_else(|| self.err_span(span, "Unknown block"))
    }

    fn p_node(&self, span: Span) -> NodeIdx {
        *self
            .nodes
            .get(self.lexer.span_str(span))
            .unwrap_or_else(|| self.err_span(span, "Undefined node"))
    }

    fn err_span(&self, span: Span, msg: &str) -> ! {
        let ((line_off, col), _) = self.lexer.line_col(span);
        let code = self
            .lexer
            .span_lines_str(span)
            .split('\n')
            .next()
            .unwrap()
            .trim();
        panic!("Line {line_off}, column {col}:\n  {code}\n{msg}");
    }
}

/// Parse the textual IR in `s` into a well-formed [Method].
///
/// # Panics
///
/// If `s` can't be parsed or describes a malformed method.
pub(crate) fn str_to_method(s: &str) -> Method {
    let lexerdef = ir_l::lexerdef();
    let lexer = lexerdef.lexer(s);
    let (res, errs) = ir_y::parse(&lexer);
    if !errs.is_empty() {
        for e in errs {
            eprintln!("{}", e.pp(&lexer, &ir_y::token_epp));
        }
        panic!("Could not parse input");
    }

    let Some(Ok((astlcls, astblocks))) = res else {
        panic!("No AST produced")
    };

    let ip = IrParser {
        lexer: &lexer,
        m: Method::new("test"),
        lcls: HashMap::new(),
        blocks: HashMap::new(),
        nodes: HashMap::new(),
    };
    ip.build(astlcls, astblocks)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_labels() {
        let m = str_to_method(
            "
          local $x: i32
          bb0:
            %7: i32 = const 0x10
            %3: i32 = const -2
            %9: i32 = mul %7, %3 ; a comment
            stlcl $x, %9
            ret
        ",
        );
        let b = &m.blocks[m.entry()];
        assert_eq!(b.nodes.len(), 5);
        assert_eq!(m.nodes[b.nodes[0]].kind, NodeKind::Const(16));
        assert_eq!(m.nodes[b.nodes[1]].kind, NodeKind::Const(-2));
        assert_eq!(
            m.nodes[b.nodes[2]].kind,
            NodeKind::BinOp {
                op: BinOp::Mul,
                lhs: b.nodes[0],
                rhs: b.nodes[1]
            }
        );
    }

    #[test]
    fn calls() {
        let m = str_to_method(
            "
          bb0:
            %0: ptr = const 4096
            %1: i64 = const 1
            %2: i64 = call [%0](%1)
            %3: ptr = const 8192
            %4: i64 = vcall [%3](%2, %1)
            call.tail @g()
            ret
        ",
        );
        let b = &m.blocks[m.entry()];
        assert!(matches!(
            m.nodes[b.nodes[2]].kind,
            NodeKind::Call {
                target: CallTarget::Indirect(_),
                tail: false,
                ..
            }
        ));
        assert!(matches!(
            m.nodes[b.nodes[4]].kind,
            NodeKind::Call {
                target: CallTarget::VirtualStub(_),
                ..
            }
        ));
        match &m.nodes[b.nodes[5]].kind {
            NodeKind::Call {
                target: CallTarget::Direct(x),
                args,
                tail: true,
            } => {
                assert_eq!(x, "g");
                assert!(args.is_empty());
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "Undefined node")]
    fn use_before_def() {
        str_to_method(
            "
          bb0:
            %1: i64 = add %0, %0
            %0: i64 = const 1
            ret
        ",
        );
    }

    #[test]
    #[should_panic(expected = "Unknown flag 'x'")]
    fn bad_flag() {
        str_to_method(
            "
          bb0:
            %0: i64 = const 1
            %1: i32 = cast.x %0
            ret
        ",
        );
    }

    #[test]
    #[should_panic(expected = "Integer types must be")]
    fn bad_int_type() {
        str_to_method(
            "
          bb0:
            %0: i7 = const 1
            ret
        ",
        );
    }
}
