use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::SourceLoc;
use crate::value::Value;

/// A block of TAC code.  Blocks are shared: the parser appends to the
/// same block a running global context reads from (REPL), and a function
/// literal's block is shared between the parse state that fills it and
/// the function value that owns it.
pub type Code = Rc<RefCell<Vec<Line>>>;

pub fn new_code() -> Code {
    Rc::new(RefCell::new(Vec::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Noop,
    AssignA,
    AssignImplicit,
    APlusB,
    AMinusB,
    ATimesB,
    ADividedByB,
    AModB,
    APowB,
    AEqualB,
    ANotEqualB,
    AGreaterThanB,
    AGreatOrEqualB,
    ALessThanB,
    ALessOrEqualB,
    AisaB,
    AAndB,
    AOrB,
    BindAssignA,
    CopyA,
    NotA,
    GotoA,
    GotoAifB,
    GotoAifTrulyB,
    GotoAifNotB,
    PushParam,
    CallFunctionA,
    CallIntrinsicA,
    ReturnA,
    ElemBofA,
    ElemBofIterA,
    LengthOfA,
}

/// One TAC instruction: a destination, an opcode, and up to two source
/// operands.  `Value::Null` stands in for an absent slot.
#[derive(Debug, Clone)]
pub struct Line {
    pub lhs: Value,
    pub op: Op,
    pub rhs_a: Value,
    pub rhs_b: Value,
    pub location: Option<SourceLoc>,
}

impl Line {
    pub fn new(lhs: Value, op: Op, rhs_a: Value, rhs_b: Value) -> Self {
        Line {
            lhs,
            op,
            rhs_a,
            rhs_b,
            location: None,
        }
    }

    pub fn unary(lhs: Value, op: Op, rhs_a: Value) -> Self {
        Line::new(lhs, op, rhs_a, Value::Null)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lhs = &self.lhs;
        let a = &self.rhs_a;
        let b = &self.rhs_b;
        let text = match self.op {
            Op::Noop => "noop".to_string(),
            Op::AssignA => format!("{lhs} := {a}"),
            Op::AssignImplicit => format!("_ := {a}"),
            Op::APlusB => format!("{lhs} := {a} + {b}"),
            Op::AMinusB => format!("{lhs} := {a} - {b}"),
            Op::ATimesB => format!("{lhs} := {a} * {b}"),
            Op::ADividedByB => format!("{lhs} := {a} / {b}"),
            Op::AModB => format!("{lhs} := {a} % {b}"),
            Op::APowB => format!("{lhs} := {a} ^ {b}"),
            Op::AEqualB => format!("{lhs} := {a} == {b}"),
            Op::ANotEqualB => format!("{lhs} := {a} != {b}"),
            Op::AGreaterThanB => format!("{lhs} := {a} > {b}"),
            Op::AGreatOrEqualB => format!("{lhs} := {a} >= {b}"),
            Op::ALessThanB => format!("{lhs} := {a} < {b}"),
            Op::ALessOrEqualB => format!("{lhs} := {a} <= {b}"),
            Op::AisaB => format!("{lhs} := {a} isa {b}"),
            Op::AAndB => format!("{lhs} := {a} and {b}"),
            Op::AOrB => format!("{lhs} := {a} or {b}"),
            Op::BindAssignA => format!("{lhs} := {a}; bind outer vars"),
            Op::CopyA => format!("{lhs} := copy of {a}"),
            Op::NotA => format!("{lhs} := not {a}"),
            Op::GotoA => format!("goto {a}"),
            Op::GotoAifB => format!("goto {a} if {b}"),
            Op::GotoAifTrulyB => format!("goto {a} if truly {b}"),
            Op::GotoAifNotB => format!("goto {a} if not {b}"),
            Op::PushParam => format!("push param {a}"),
            Op::CallFunctionA => format!("{lhs} := call {a} with {b} args"),
            Op::CallIntrinsicA => format!("intrinsic #{}", a.int_value()),
            Op::ReturnA => format!("{lhs} := {a}; return"),
            Op::ElemBofA => format!("{lhs} = {a}[{b}]"),
            Op::ElemBofIterA => format!("{lhs} = {a} iter {b}"),
            Op::LengthOfA => format!("{lhs} = len({a})"),
        };
        match &self.location {
            Some(loc) => write!(f, "{text}\t// {loc}"),
            None => write!(f, "{text}"),
        }
    }
}

/// Render a code block for debugging, highlighting one line and recursing
/// into function literals.
pub fn dump(code: &[Line], line_num_to_highlight: i64, out: &mut String) {
    for (line_num, line) in code.iter().enumerate() {
        let marker = if line_num as i64 == line_num_to_highlight {
            "> "
        } else {
            "  "
        };
        out.push_str(&format!("{marker}{line_num}. {line}\n"));
        if line.op == Op::BindAssignA {
            if let Value::Function(func) = &line.rhs_a {
                dump(&func.func.code.borrow(), -1, out);
            }
        }
    }
}
