use std::ops::Deref;

use crate::builder::SysBuilder;
use crate::ir::*;

use super::block::Block;
use super::data::{Array, IntImm, StrImm};
use super::expr::Expr;
use super::instructions::AsInstruction;
use super::module::Module;
use super::port::FIFO;
use super::user::Operand;

/// The common interface of every element stored in the system's slab arena.
pub trait IsElement<'elem, 'sys: 'elem>: Sized {
  fn upcast(&self) -> BaseNode;
  fn set_key(&mut self, key: usize);
  fn get_key(&self) -> usize;
  fn into_reference(key: usize) -> BaseNode;
  fn downcast(slab: &'sys slab::Slab<Element>, node: &BaseNode) -> Result<&'elem Self, String>;
  fn downcast_mut(
    slab: &'sys mut slab::Slab<Element>,
    node: &BaseNode,
  ) -> Result<&'elem mut Self, String>;
}

/// Elements residing in the IR tree have a parent.
pub trait Parented {
  fn get_parent(&self) -> BaseNode;
  fn set_parent(&mut self, parent: BaseNode);
}

pub trait Referencable<'elem, 'sys: 'elem, T: IsElement<'elem, 'sys>> {
  type Reference;
  fn reference(sys: &'sys SysBuilder, elem: BaseNode) -> Self::Reference;
}

pub trait Mutable<'elem, 'sys: 'elem, T: IsElement<'elem, 'sys>> {
  type Mutator;
  fn mutator(sys: &'sys mut SysBuilder, elem: BaseNode) -> Self::Mutator;
}

macro_rules! register_element {
  ($name:ident) => {
    paste::paste! {
      impl From<$name> for Element {
        fn from(elem: $name) -> Element {
          Element::$name(Box::new(elem))
        }
      }

      impl<'elem, 'sys: 'elem> IsElement<'elem, 'sys> for $name {
        fn set_key(&mut self, key: usize) {
          self.key = key;
        }

        fn get_key(&self) -> usize {
          self.key
        }

        fn upcast(&self) -> BaseNode {
          BaseNode::new(NodeKind::$name, self.key)
        }

        fn into_reference(key: usize) -> BaseNode {
          BaseNode::new(NodeKind::$name, key)
        }

        fn downcast(
          slab: &'sys slab::Slab<Element>,
          node: &BaseNode,
        ) -> Result<&'elem $name, String> {
          if let NodeKind::$name = node.get_kind() {
            if let Element::$name(res) = &slab[node.get_key()] {
              return Ok(&**res);
            }
          }
          Err(format!(
            "downcast: expecting {}, got {:?}({})",
            stringify!($name),
            node.get_kind(),
            node.get_key()
          ))
        }

        fn downcast_mut(
          slab: &'sys mut slab::Slab<Element>,
          node: &BaseNode,
        ) -> Result<&'elem mut $name, String> {
          if let NodeKind::$name = node.get_kind() {
            if let Element::$name(res) = &mut slab[node.get_key()] {
              return Ok(&mut **res);
            }
          }
          Err(format!(
            "downcast: expecting {}, got {:?}({})",
            stringify!($name),
            node.get_kind(),
            node.get_key()
          ))
        }
      }

      pub struct [<$name Ref>]<'sys> {
        pub(crate) sys: &'sys SysBuilder,
        pub(crate) elem: BaseNode,
      }

      pub struct [<$name Mut>]<'sys> {
        pub(crate) sys: &'sys mut SysBuilder,
        pub(crate) elem: BaseNode,
      }

      impl<'sys> [<$name Ref>]<'sys> {
        pub fn get<'borrow, 'res>(&'borrow self) -> &'res $name
        where
          'sys: 'borrow,
          'sys: 'res,
          'borrow: 'res,
        {
          <$name>::downcast(&self.sys.slab, &self.elem).unwrap()
        }

        pub fn upcast(&self) -> BaseNode {
          self.elem
        }
      }

      impl Deref for [<$name Ref>]<'_> {
        type Target = $name;

        fn deref(&self) -> &Self::Target {
          self.get()
        }
      }

      impl<'sys> [<$name Mut>]<'sys> {
        pub fn get<'borrow>(&'borrow self) -> &'borrow $name
        where
          'sys: 'borrow,
        {
          <$name>::downcast(&self.sys.slab, &self.elem).unwrap()
        }

        pub fn get_mut<'borrow>(&'borrow mut self) -> &'borrow mut $name
        where
          'sys: 'borrow,
        {
          <$name>::downcast_mut(&mut self.sys.slab, &self.elem).unwrap()
        }

        pub fn upcast(&self) -> BaseNode {
          self.elem
        }
      }

      impl<'elem, 'sys: 'elem> Referencable<'elem, 'sys, $name> for $name {
        type Reference = [<$name Ref>]<'sys>;

        fn reference(sys: &'sys SysBuilder, elem: BaseNode) -> Self::Reference {
          if let NodeKind::$name = elem.get_kind() {
            [<$name Ref>] { sys, elem }
          } else {
            panic!("{:?} is not a {}", elem, stringify!($name));
          }
        }
      }

      impl<'elem, 'sys: 'elem> Mutable<'elem, 'sys, $name> for $name {
        type Mutator = [<$name Mut>]<'sys>;

        fn mutator(sys: &'sys mut SysBuilder, elem: BaseNode) -> Self::Mutator {
          if let NodeKind::$name = elem.get_kind() {
            [<$name Mut>] { sys, elem }
          } else {
            panic!("{:?} is not a {}", elem, stringify!($name));
          }
        }
      }
    }
  };
}

register_element!(Module);
register_element!(FIFO);
register_element!(Expr);
register_element!(Array);
register_element!(IntImm);
register_element!(StrImm);
register_element!(Block);
register_element!(Operand);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeKind {
  Module,
  FIFO,
  Expr,
  Array,
  IntImm,
  StrImm,
  Block,
  Operand,
  Unknown,
}

/// A lightweight handle into the system slab. The handle is what IR nodes store to refer to
/// each other, so the mutually-referencing graph carries no ownership cycles.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BaseNode {
  kind: NodeKind,
  key: usize,
}

/// The key for interned nodes of the builder.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum CacheKey {
  IntImm(DataType, u64),
  StrImm(String),
}

impl BaseNode {
  pub fn new(kind: NodeKind, key: usize) -> Self {
    Self { kind, key }
  }

  pub fn unknown() -> Self {
    Self::new(NodeKind::Unknown, 0)
  }

  pub fn is_unknown(&self) -> bool {
    self.kind == NodeKind::Unknown
  }

  pub fn get_key(&self) -> usize {
    self.key
  }

  pub fn get_kind(&self) -> NodeKind {
    self.kind
  }

  pub fn as_ref<'elem, 'sys: 'elem, T>(&self, sys: &'sys SysBuilder) -> Result<T::Reference, String>
  where
    T: IsElement<'elem, 'sys> + Referencable<'elem, 'sys, T>,
  {
    Ok(T::reference(sys, *self))
  }

  pub fn as_mut<'elem, 'sys: 'elem, T>(
    &self,
    sys: &'sys mut SysBuilder,
  ) -> Result<T::Mutator, String>
  where
    T: IsElement<'elem, 'sys> + Mutable<'elem, 'sys, T>,
  {
    Ok(T::mutator(sys, *self))
  }

  /// Downcast an expression node into its typed instruction view.
  pub fn as_inst<'sys, T: AsInstruction<'sys>>(&self, sys: &'sys SysBuilder) -> Result<T, String> {
    T::downcast(self.as_ref::<Expr>(sys)?)
  }

  pub fn get_dtype(&self, sys: &SysBuilder) -> Option<DataType> {
    match self.kind {
      NodeKind::IntImm => self.as_ref::<IntImm>(sys).unwrap().dtype().into(),
      NodeKind::StrImm => DataType::Str.into(),
      NodeKind::FIFO => self.as_ref::<FIFO>(sys).unwrap().scalar_ty().into(),
      NodeKind::Expr => self.as_ref::<Expr>(sys).unwrap().dtype().into(),
      NodeKind::Array => self.as_ref::<Array>(sys).unwrap().dtype().into(),
      NodeKind::Operand => {
        let value = *self.as_ref::<Operand>(sys).unwrap().get_value();
        value.get_dtype(sys)
      }
      NodeKind::Module | NodeKind::Block => None,
      NodeKind::Unknown => panic!("Unknown node has no dtype"),
    }
  }

  pub fn get_parent(&self, sys: &SysBuilder) -> Option<BaseNode> {
    match self.kind {
      NodeKind::FIFO => self.as_ref::<FIFO>(sys).unwrap().get_parent().into(),
      NodeKind::Block => self.as_ref::<Block>(sys).unwrap().get_parent().into(),
      NodeKind::Expr => self.as_ref::<Expr>(sys).unwrap().get_parent().into(),
      NodeKind::Unknown => panic!("Unknown node has no parent"),
      _ => None,
    }
  }

  /// The module that transitively owns this node, if any.
  pub fn owner_module(&self, sys: &SysBuilder) -> Option<BaseNode> {
    match self.kind {
      NodeKind::Module => Some(*self),
      NodeKind::FIFO => Some(self.as_ref::<FIFO>(sys).unwrap().get_parent()),
      NodeKind::Expr | NodeKind::Block => {
        let mut runner = self.get_parent(sys)?;
        while runner.get_kind() != NodeKind::Module {
          runner = runner.get_parent(sys)?;
        }
        Some(runner)
      }
      _ => None,
    }
  }

  pub fn to_string(&self, sys: &SysBuilder) -> String {
    match self.kind {
      NodeKind::Module => self.as_ref::<Module>(sys).unwrap().get_name().to_string(),
      NodeKind::Array => self.as_ref::<Array>(sys).unwrap().get_name().to_string(),
      NodeKind::FIFO => {
        let fifo = self.as_ref::<FIFO>(sys).unwrap();
        let module = fifo.get_parent().to_string(sys);
        format!("{}.{}", module, fifo.get_name())
      }
      NodeKind::IntImm => {
        let imm = self.as_ref::<IntImm>(sys).unwrap();
        format!("({}:{})", imm.get_value(), imm.dtype().to_string())
      }
      NodeKind::StrImm => {
        let imm = self.as_ref::<StrImm>(sys).unwrap();
        format!("{:?}", imm.get_value())
      }
      NodeKind::Expr => self.as_ref::<Expr>(sys).unwrap().get_name(),
      NodeKind::Operand => {
        let value = *self.as_ref::<Operand>(sys).unwrap().get_value();
        value.to_string(sys)
      }
      NodeKind::Block => format!("block_{}", self.key),
      NodeKind::Unknown => "<unknown>".into(),
    }
  }
}

/// The owning storage of every IR element.
pub enum Element {
  Module(Box<Module>),
  FIFO(Box<FIFO>),
  Expr(Box<Expr>),
  Array(Box<Array>),
  IntImm(Box<IntImm>),
  StrImm(Box<StrImm>),
  Block(Box<Block>),
  Operand(Box<Operand>),
}
