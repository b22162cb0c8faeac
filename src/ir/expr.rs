use std::collections::HashSet;

use crate::ir::node::*;
use crate::ir::*;

use super::block::Block;
use super::module::Module;
use super::user::Operand;

pub mod subcode;

// Picks the subcode's representation when one exists, the variant name otherwise.
macro_rules! opcode_repr {
  ($sub:ident, $var:ident) => {
    $sub.to_string()
  };
  (, $var:ident) => {
    stringify!($var).to_string()
  };
}

macro_rules! opcode_mnemonic {
  ($sub:ident, $var:ident) => {
    $sub.mnemonic().to_string()
  };
  (, $var:ident) => {
    stringify!($var).to_lowercase()
  };
}

macro_rules! register_opcodes {
  ( $( $var_id:ident $( { $sub:ident : $subty:ty } )? ( $arity:literal ) ),* $(,)? ) => {
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub enum Opcode {
      $( $var_id $( { $sub : $subty } )? ),*
    }

    impl ToString for Opcode {
      fn to_string(&self) -> String {
        match self {
          $( Opcode::$var_id $( { $sub } )? => opcode_repr!($( $sub )?, $var_id) ),*
        }
      }
    }

    impl Opcode {
      /// The number of operands, or None for variadic opcodes.
      pub fn arity(&self) -> Option<usize> {
        let res: i64 = match self {
          $( Opcode::$var_id $( { $sub } )? => {
            $( let _ = $sub; )?
            $arity
          } ),*
        };
        (res >= 0).then(|| res as usize)
      }

      /// An identifier-friendly mnemonic, used by the deterministic namer.
      pub fn mnemonic(&self) -> String {
        match self {
          $( Opcode::$var_id $( { $sub } )? => opcode_mnemonic!($( $sub )?, $var_id) ),*
        }
      }
    }
  };
}

register_opcodes!(
  // Arithmetic and logic
  Binary { binop: subcode::Binary }(2),
  Unary { uop: subcode::Unary }(1),
  Compare { cmp: subcode::Compare }(2),
  Select(3),
  Select1Hot(-1),
  // Register array access
  ArrayRead(2 /*array idx*/),
  ArrayWrite(4 /*array idx value writer*/),
  // FIFO ports and eventual operations
  FIFOPush(2 /*fifo value*/),
  FIFOPop(1 /*fifo*/),
  FIFOField { field: subcode::FIFOField }(1),
  Triggered(1 /*module*/),
  Bind(-1 /*callee push...*/),
  AsyncCall(1 /*bind*/),
  // Bit manipulation
  Slice(3 /*x l r*/),
  Concat(2 /*msb lsb*/),
  Cast { cast: subcode::Cast }(1),
  // Non-synthesizable operations
  Log(-1),
  Intrinsic { intrin: subcode::Intrinsic }(-1),
);

impl Opcode {
  pub fn is_binary(&self) -> bool {
    matches!(self, Opcode::Binary { .. })
  }

  pub fn is_unary(&self) -> bool {
    matches!(self, Opcode::Unary { .. })
  }

  pub fn is_cmp(&self) -> bool {
    matches!(self, Opcode::Compare { .. })
  }

  /// Whether this operation produces a value.
  pub fn is_valued(&self) -> bool {
    match self {
      Opcode::Binary { .. }
      | Opcode::Unary { .. }
      | Opcode::Compare { .. }
      | Opcode::Select
      | Opcode::Select1Hot
      | Opcode::ArrayRead
      | Opcode::FIFOPop
      | Opcode::FIFOField { .. }
      | Opcode::Triggered
      | Opcode::Bind
      | Opcode::Slice
      | Opcode::Concat
      | Opcode::Cast { .. } => true,
      Opcode::Intrinsic { intrin } => intrin.is_valued(),
      Opcode::ArrayWrite
      | Opcode::FIFOPush
      | Opcode::AsyncCall
      | Opcode::Log => false,
    }
  }

  /// Whether this operation mutates simulation state.
  pub fn has_side_effect(&self) -> bool {
    match self {
      Opcode::ArrayWrite
      | Opcode::FIFOPush
      | Opcode::FIFOPop
      | Opcode::AsyncCall
      | Opcode::Log => true,
      Opcode::Intrinsic { intrin } => !matches!(
        intrin,
        subcode::Intrinsic::HasMemResp | subcode::Intrinsic::MemResp
      ),
      _ => false,
    }
  }
}

/// An expression node. Operands are `Operand` elements carrying a back-pointer to this
/// expression, so every value knows its users.
pub struct Expr {
  pub(crate) key: usize,
  name: Option<String>,
  parent: BaseNode,
  dtype: DataType,
  opcode: Opcode,
  /// The conjunction of all enclosing condition-scope predicates when this node was built.
  meta_cond: Option<BaseNode>,
  pub(crate) operands: Vec<BaseNode>,
  pub(crate) user_set: HashSet<BaseNode>,
}

impl Expr {
  pub(crate) fn new(
    dtype: DataType,
    opcode: Opcode,
    operands: Vec<BaseNode>,
    parent: BaseNode,
    meta_cond: Option<BaseNode>,
  ) -> Self {
    Self {
      key: 0,
      name: None,
      parent,
      dtype,
      opcode,
      meta_cond,
      operands,
      user_set: HashSet::new(),
    }
  }

  pub fn get_opcode(&self) -> Opcode {
    self.opcode
  }

  pub fn get_num_operands(&self) -> usize {
    self.operands.len()
  }

  pub fn get_meta_cond(&self) -> Option<BaseNode> {
    self.meta_cond
  }

  pub fn get_name(&self) -> String {
    self
      .name
      .clone()
      .unwrap_or_else(|| format!("_{}", self.key))
  }

  pub fn has_explicit_name(&self) -> bool {
    self.name.is_some()
  }
}

impl Typed for Expr {
  fn dtype(&self) -> DataType {
    self.dtype.clone()
  }
}

impl Parented for Expr {
  fn get_parent(&self) -> BaseNode {
    self.parent
  }

  fn set_parent(&mut self, parent: BaseNode) {
    self.parent = parent;
  }
}

impl<'sys> ExprRef<'sys> {
  pub fn get_operand(&self, i: usize) -> Option<OperandRef<'_>> {
    self
      .get()
      .operands
      .get(i)
      .map(|x| x.as_ref::<Operand>(self.sys).unwrap())
  }

  pub fn get_operand_value(&self, i: usize) -> Option<BaseNode> {
    self.get_operand(i).map(|x| *x.get_value())
  }

  pub fn operand_iter(&self) -> impl Iterator<Item = OperandRef<'_>> {
    self
      .get()
      .operands
      .iter()
      .map(|x| x.as_ref::<Operand>(self.sys).unwrap())
  }

  pub fn users(&self) -> &HashSet<BaseNode> {
    &self.get().user_set
  }

  /// The module that owns this expression.
  pub fn get_module(&self) -> BaseNode {
    let block = self.get().get_parent();
    block
      .as_ref::<Block>(self.sys)
      .unwrap()
      .get_module()
      .upcast()
  }
}

impl ExprMut<'_> {
  /// Override the automatic name. The name is uniquified through the owning module's
  /// symbol table so generated code never collides.
  pub fn set_name(&mut self, name: String) {
    let module = {
      let expr = self.elem.as_ref::<Expr>(self.sys).unwrap();
      expr.get_module()
    };
    let unique = {
      let mut module = module.as_mut::<Module>(self.sys).unwrap();
      module.get_mut().symbol_table.identifier(&name)
    };
    self.get_mut().name = Some(unique);
  }
}
