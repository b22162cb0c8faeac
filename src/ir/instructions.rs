use super::expr::subcode;
use super::expr::Opcode;
#[allow(unused_imports)]
use super::node::{ArrayRef, BaseNode, ExprRef, FIFORef, IntImmRef, ModuleRef, StrImmRef};
use crate::ir::{self, node::IsElement};

/// Typed views over `Expr` nodes. Downcasting checks the opcode; the view then exposes
/// the operands under their semantic names.
pub trait AsInstruction<'a>: Sized {
  fn downcast(expr: ExprRef<'a>) -> Result<Self, String>;
}

macro_rules! register_instruction {
  (@accessor $inst:ident => ($method:ident, $idx:expr, BaseNode) $( $rest:tt )*) => {
    impl $inst<'_> {
      pub fn $method(&self) -> BaseNode {
        self.expr.get_operand_value($idx).unwrap()
      }
    }
    register_instruction!(@accessor $inst => $( $rest )*);
  };

  (@accessor $inst:ident => ($method:ident, $idx:expr, node::$ty:ident) $( $rest:tt )*) => {
    paste::paste! {
      impl<'a> $inst<'a> {
        // The returned reference borrows the arena, not this view, so it can outlive
        // the (often temporary) instruction wrapper.
        pub fn $method(&self) -> [<$ty Ref>]<'a> {
          self
            .expr
            .get_operand_value($idx)
            .unwrap()
            .as_ref::<ir::$ty>(self.expr.sys)
            .unwrap()
        }
      }
    }
    register_instruction!(@accessor $inst => $( $rest )*);
  };

  (@accessor $inst:ident => ) => {};

  ( $( $inst:ident [ $opcode:pat ] => { $( ( $($accessor:tt)* ) )* } ),* $(,)? ) => {
    $(
      pub struct $inst<'a> {
        expr: ExprRef<'a>,
      }

      impl<'a> AsInstruction<'a> for $inst<'a> {
        fn downcast(expr: ExprRef<'a>) -> Result<Self, String> {
          if let $opcode = expr.get_opcode() {
            Ok($inst { expr })
          } else {
            Err(format!(
              "Expecting {}, but got {:?}",
              stringify!($inst),
              expr.get_opcode()
            ))
          }
        }
      }

      impl<'a> $inst<'a> {
        pub fn expr(&self) -> &ExprRef<'a> {
          &self.expr
        }

        pub fn upcast(&self) -> BaseNode {
          self.expr.get().upcast()
        }
      }

      register_instruction!(@accessor $inst => $( ( $($accessor)* ) )*);
    )*
  };
}

register_instruction!(
  ArrayRead[Opcode::ArrayRead] => { (array, 0, node::Array) (idx, 1, BaseNode) },
  ArrayWrite[Opcode::ArrayWrite] => {
    (array, 0, node::Array) (idx, 1, BaseNode) (value, 2, BaseNode) (writer, 3, node::Module)
  },
  FIFOPush[Opcode::FIFOPush] => { (fifo, 0, node::FIFO) (value, 1, BaseNode) },
  FIFOPop[Opcode::FIFOPop] => { (fifo, 0, node::FIFO) },
  FIFOField[Opcode::FIFOField { .. }] => { (fifo, 0, node::FIFO) },
  Triggered[Opcode::Triggered] => { (module, 0, node::Module) },
  Bind[Opcode::Bind] => { (callee, 0, node::Module) },
  AsyncCall[Opcode::AsyncCall] => { (bind, 0, BaseNode) },
  BinaryInst[Opcode::Binary { .. }] => { (lhs, 0, BaseNode) (rhs, 1, BaseNode) },
  UnaryInst[Opcode::Unary { .. }] => { (x, 0, BaseNode) },
  CompareInst[Opcode::Compare { .. }] => { (lhs, 0, BaseNode) (rhs, 1, BaseNode) },
  Select[Opcode::Select] => {
    (cond, 0, BaseNode) (true_value, 1, BaseNode) (false_value, 2, BaseNode)
  },
  Select1Hot[Opcode::Select1Hot] => { (cond, 0, BaseNode) },
  Slice[Opcode::Slice] => { (x, 0, BaseNode) (l, 1, node::IntImm) (r, 2, node::IntImm) },
  Concat[Opcode::Concat] => { (msb, 0, BaseNode) (lsb, 1, BaseNode) },
  CastInst[Opcode::Cast { .. }] => { (x, 0, BaseNode) },
  Log[Opcode::Log] => { (fmt, 0, node::StrImm) },
  IntrinsicInst[Opcode::Intrinsic { .. }] => {},
);

impl BinaryInst<'_> {
  pub fn get_binop(&self) -> subcode::Binary {
    match self.expr.get_opcode() {
      Opcode::Binary { binop } => binop,
      _ => unreachable!(),
    }
  }
}

impl UnaryInst<'_> {
  pub fn get_uop(&self) -> subcode::Unary {
    match self.expr.get_opcode() {
      Opcode::Unary { uop } => uop,
      _ => unreachable!(),
    }
  }
}

impl CompareInst<'_> {
  pub fn get_cmp(&self) -> subcode::Compare {
    match self.expr.get_opcode() {
      Opcode::Compare { cmp } => cmp,
      _ => unreachable!(),
    }
  }
}

impl FIFOField<'_> {
  pub fn get_field(&self) -> subcode::FIFOField {
    match self.expr.get_opcode() {
      Opcode::FIFOField { field } => field,
      _ => unreachable!(),
    }
  }
}

impl CastInst<'_> {
  pub fn get_cast(&self) -> subcode::Cast {
    match self.expr.get_opcode() {
      Opcode::Cast { cast } => cast,
      _ => unreachable!(),
    }
  }
}

impl IntrinsicInst<'_> {
  pub fn get_intrin(&self) -> subcode::Intrinsic {
    match self.expr.get_opcode() {
      Opcode::Intrinsic { intrin } => intrin,
      _ => unreachable!(),
    }
  }

  pub fn arg(&self, i: usize) -> BaseNode {
    self.expr.get_operand_value(i).unwrap()
  }
}

impl Select1Hot<'_> {
  /// The selectable values, one per hot bit.
  pub fn value_iter(&self) -> impl Iterator<Item = BaseNode> + '_ {
    (1..self.expr.get_num_operands()).map(|i| self.expr.get_operand_value(i).unwrap())
  }
}

impl Bind<'_> {
  /// The accumulated pushes against the callee's ports.
  pub fn push_iter(&self) -> impl Iterator<Item = BaseNode> + '_ {
    (1..self.expr.get_num_operands()).map(|i| self.expr.get_operand_value(i).unwrap())
  }

  /// A bind is complete when every callee port has a push against it.
  pub fn is_fully_bound(&self) -> bool {
    let sys = self.expr.sys;
    let callee = self.callee();
    let mut bound = std::collections::HashSet::new();
    for push in self.push_iter() {
      let push = push.as_inst::<FIFOPush>(sys).unwrap();
      bound.insert(push.fifo().upcast());
    }
    let result = callee.port_iter().all(|port| bound.contains(&port.upcast()));
    result
  }
}

impl<'a> AsyncCall<'a> {
  pub fn callee(&self) -> ModuleRef<'a> {
    let bind = self.bind().as_inst::<Bind>(self.expr.sys).unwrap();
    bind.callee()
  }
}

impl Log<'_> {
  /// The interpolated arguments, after the format string.
  pub fn arg_iter(&self) -> impl Iterator<Item = BaseNode> + '_ {
    (1..self.expr.get_num_operands()).map(|i| self.expr.get_operand_value(i).unwrap())
  }
}

impl ArrayRead<'_> {
  pub fn array_node(&self) -> BaseNode {
    self.expr.get_operand_value(0).unwrap()
  }
}

impl ArrayWrite<'_> {
  pub fn array_node(&self) -> BaseNode {
    self.expr.get_operand_value(0).unwrap()
  }
}
