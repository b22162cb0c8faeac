use std::collections::HashMap;

use crate::ir::expr::subcode;
use crate::ir::instructions::{Bind, FIFOPush};
use crate::ir::node::*;
use crate::ir::*;

use super::symbol_table::SymbolTable;

/// Where the next expression lands: (module, block, position). `None` appends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertPoint {
  pub module: BaseNode,
  pub block: BaseNode,
  pub at: Option<usize>,
}

impl InsertPoint {
  fn unknown() -> Self {
    Self {
      module: BaseNode::unknown(),
      block: BaseNode::unknown(),
      at: None,
    }
  }
}

/// A lexical scope inside a module body: the root block, a condition block, or a
/// testbench cycle block.
pub(crate) enum ScopeKind {
  Root,
  /// `carry` is the conjunction of this and all enclosing conditions.
  Cond { carry: BaseNode },
  Cycle,
}

pub(crate) struct Scope {
  pub(crate) kind: ScopeKind,
  block: BaseNode,
  /// Array reads already performed in this scope, for read reuse.
  read_cache: HashMap<(BaseNode, BaseNode), BaseNode>,
  restore: InsertPoint,
}

/// One module-entry frame. Downstream construction may nest inside another module's
/// context, so these form a stack.
struct ModuleCtx {
  scopes: Vec<Scope>,
  restore: InsertPoint,
}

/// The information of an input port of a module. Ports are meaningless without a module,
/// so users describe them and `create_module` materializes them.
pub struct PortInfo {
  pub name: String,
  pub ty: DataType,
}

impl PortInfo {
  pub fn new(name: &str, ty: DataType) -> Self {
    Self {
      name: name.into(),
      ty,
    }
  }
}

/// A cached handle representing one module's private write port into an array.
/// Obtained with `SysBuilder::write_port`; the first write from a module registers it
/// in the array's writer list, which later determines physical port allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WritePort {
  pub array: BaseNode,
  pub module: BaseNode,
}

/// The `SysBuilder` is both the owner of the whole system graph and the IR builder.
/// Construction happens through it; after construction it is handed read-only to the
/// analysis layer and the backends.
pub struct SysBuilder {
  /// The slab storing every element of the system. The graph is highly mutually
  /// referenced, so elements live in one arena addressed by `BaseNode` keys.
  pub(crate) slab: slab::Slab<Element>,
  name: String,
  /// Interned constants and string immediates.
  cached_nodes: HashMap<CacheKey, BaseNode>,
  /// Sequential modules in creation order.
  pub(crate) modules: Vec<BaseNode>,
  /// Downstream (combinational) modules in creation order.
  pub(crate) downstreams: Vec<BaseNode>,
  /// Register arrays in creation order.
  pub(crate) arrays: Vec<BaseNode>,
  /// Name lookup for modules and arrays.
  global_symbols: HashMap<String, BaseNode>,
  /// System-wide identifier uniquifier.
  symbol_table: SymbolTable,
  insert_point: InsertPoint,
  module_stack: Vec<ModuleCtx>,
  /// Registered (array, module) write ports.
  write_ports: HashMap<(BaseNode, BaseNode), WritePort>,
  /// Per-push FIFO depth hints, set through `set_fifo_depth`.
  fifo_depths: HashMap<BaseNode, usize>,
}

impl SysBuilder {
  pub fn new(name: &str) -> Self {
    Self {
      slab: slab::Slab::new(),
      name: name.into(),
      cached_nodes: HashMap::new(),
      modules: Vec::new(),
      downstreams: Vec::new(),
      arrays: Vec::new(),
      global_symbols: HashMap::new(),
      symbol_table: SymbolTable::new(),
      insert_point: InsertPoint::unknown(),
      module_stack: Vec::new(),
      write_ports: HashMap::new(),
      fifo_depths: HashMap::new(),
    }
  }

  pub fn get_name(&self) -> &str {
    self.name.as_str()
  }

  pub(crate) fn get<'elem, 'sys: 'elem, T>(
    &'sys self,
    key: &BaseNode,
  ) -> Result<T::Reference, String>
  where
    T: IsElement<'elem, 'sys> + Referencable<'elem, 'sys, T>,
  {
    Ok(T::reference(self, *key))
  }

  pub(crate) fn get_mut<'elem, 'sys: 'elem, T>(
    &'sys mut self,
    key: &BaseNode,
  ) -> Result<T::Mutator, String>
  where
    T: IsElement<'elem, 'sys> + Mutable<'elem, 'sys, T>,
  {
    Ok(T::mutator(self, *key))
  }

  /// Insert an element into the arena and patch its self key.
  pub(crate) fn insert_element<'sys, T>(&'sys mut self, elem: T) -> BaseNode
  where
    T: IsElement<'sys, 'sys> + Into<Element> + 'sys,
  {
    let key = self.slab.insert(elem.into());
    let res = T::into_reference(key);
    T::downcast_mut(&mut self.slab, &res).unwrap().set_key(key);
    res
  }

  pub(crate) fn identifier(&mut self, id: &str) -> String {
    self.symbol_table.identifier(id)
  }

  // ---------------------------------------------------------------------------
  // Iteration and lookup.

  pub fn module_iter(&self) -> impl Iterator<Item = ModuleRef<'_>> {
    self.modules.iter().map(|x| x.as_ref::<Module>(self).unwrap())
  }

  pub fn downstream_iter(&self) -> impl Iterator<Item = ModuleRef<'_>> {
    self
      .downstreams
      .iter()
      .map(|x| x.as_ref::<Module>(self).unwrap())
  }

  pub fn array_iter(&self) -> impl Iterator<Item = ArrayRef<'_>> {
    self.arrays.iter().map(|x| x.as_ref::<Array>(self).unwrap())
  }

  pub fn get_module(&self, name: &str) -> Option<ModuleRef<'_>> {
    self
      .global_symbols
      .get(name)
      .filter(|x| x.get_kind() == NodeKind::Module)
      .map(|x| x.as_ref::<Module>(self).unwrap())
  }

  pub fn get_array(&self, name: &str) -> Option<ArrayRef<'_>> {
    self
      .global_symbols
      .get(name)
      .filter(|x| x.get_kind() == NodeKind::Array)
      .map(|x| x.as_ref::<Array>(self).unwrap())
  }

  pub fn has_driver(&self) -> bool {
    self.get_module("driver").is_some()
  }

  pub fn has_testbench(&self) -> bool {
    self.get_module("testbench").is_some()
  }

  /// The per-push FIFO depth hint, if any.
  pub fn fifo_depth_of(&self, push: &BaseNode) -> Option<usize> {
    self.fifo_depths.get(push).copied()
  }

  // ---------------------------------------------------------------------------
  // Module context management.

  pub fn get_current_module(&self) -> Result<ModuleRef<'_>, String> {
    if self.module_stack.is_empty() {
      return Err("No module context is active".into());
    }
    self.get::<Module>(&self.insert_point.module)
  }

  pub(crate) fn get_current_module_node(&self) -> BaseNode {
    assert!(
      !self.module_stack.is_empty(),
      "IR cannot be constructed outside of a module context"
    );
    self.insert_point.module
  }

  /// Enter a module's body. Module entries nest (a downstream can be built while a
  /// sequential module is under construction) and must be balanced with `exit_module`.
  pub fn enter_module(&mut self, module: BaseNode) {
    let body = self.get::<Module>(&module).unwrap().get_body().upcast();
    let restore = self.insert_point.clone();
    self.module_stack.push(ModuleCtx {
      scopes: vec![Scope {
        kind: ScopeKind::Root,
        block: body,
        read_cache: HashMap::new(),
        restore: restore.clone(),
      }],
      restore,
    });
    self.insert_point = InsertPoint {
      module,
      block: body,
      at: None,
    };
  }

  pub fn exit_module(&mut self) {
    let ctx = self
      .module_stack
      .pop()
      .expect("exit_module without a matching enter_module");
    assert!(
      ctx.scopes.len() == 1,
      "Exiting module {} with {} dangling condition scope(s)",
      self.insert_point.module.to_string(self),
      ctx.scopes.len() - 1
    );
    self.insert_point = ctx.restore;
  }

  /// Build inside a module with balanced entry/exit.
  pub fn in_module<F: FnOnce(&mut SysBuilder)>(&mut self, module: BaseNode, f: F) {
    self.enter_module(module);
    f(self);
    self.exit_module();
  }

  fn current_ctx_mut(&mut self) -> &mut ModuleCtx {
    self
      .module_stack
      .last_mut()
      .expect("No module context is active")
  }

  fn current_ctx(&self) -> &ModuleCtx {
    self
      .module_stack
      .last()
      .expect("No module context is active")
  }

  /// The cumulative predicate of all enclosing condition scopes, if any.
  pub fn current_carry(&self) -> Option<BaseNode> {
    if self.module_stack.is_empty() {
      return None;
    }
    self
      .current_ctx()
      .scopes
      .iter()
      .rev()
      .find_map(|x| match &x.kind {
        ScopeKind::Cond { carry } => Some(*carry),
        _ => None,
      })
  }

  // ---------------------------------------------------------------------------
  // Scoped blocks.

  /// Open a conditionally executed block. Side effects constructed inside carry the
  /// conjunction of this and all enclosing conditions as their `meta_cond`.
  pub fn enter_condition(&mut self, cond: BaseNode) -> BaseNode {
    assert_eq!(
      cond.get_dtype(self).map(|x| x.get_bits()),
      Some(1),
      "Condition must be a 1-bit value"
    );
    let module = self.get_current_module_node();
    let carry = if let Some(parent) = self.current_carry() {
      self.create_binary(subcode::Binary::BitwiseAnd, parent, cond)
    } else {
      cond
    };
    let block = self.create_block(BlockKind::Condition(cond));
    // A condition defined in another module (downstream consumption) is an external
    // interface of this module, just like any other foreign operand.
    if let NodeKind::Expr = cond.get_kind() {
      let owner = cond.owner_module(self).unwrap();
      if owner != module {
        assert!(
          self.get::<Module>(&module).unwrap().is_downstream(),
          "{} is owned by module {}, but guards a condition in {}; only downstream \
           modules may consume foreign values",
          cond.to_string(self),
          owner.to_string(self),
          module.to_string(self)
        );
        let operand = self.insert_element(Operand::new(cond));
        operand
          .as_mut::<Operand>(self)
          .unwrap()
          .get_mut()
          .set_user(block);
        self.add_user(operand);
        self
          .get_mut::<Module>(&module)
          .unwrap()
          .add_external(cond, operand);
      }
    }
    let restore = self.insert_point.clone();
    self.current_ctx_mut().scopes.push(Scope {
      kind: ScopeKind::Cond { carry },
      block,
      read_cache: HashMap::new(),
      restore,
    });
    self.insert_point = InsertPoint {
      module,
      block,
      at: None,
    };
    block
  }

  pub fn exit_condition(&mut self) {
    let scope = self.current_ctx_mut().scopes.pop().expect("No scope to exit");
    assert!(
      matches!(scope.kind, ScopeKind::Cond { .. }),
      "exit_condition does not match the innermost scope"
    );
    assert_eq!(
      scope.block, self.insert_point.block,
      "exit_condition while the insert point is elsewhere"
    );
    self.insert_point = scope.restore;
  }

  pub fn in_condition<F: FnOnce(&mut SysBuilder)>(&mut self, cond: BaseNode, f: F) {
    self.enter_condition(cond);
    f(self);
    self.exit_condition();
  }

  /// Open a testbench block fired at an absolute simulated cycle.
  pub fn enter_cycle(&mut self, cycle: usize) -> BaseNode {
    let module = self.get_current_module_node();
    let block = self.create_block(BlockKind::Cycle(cycle));
    let restore = self.insert_point.clone();
    self.current_ctx_mut().scopes.push(Scope {
      kind: ScopeKind::Cycle,
      block,
      read_cache: HashMap::new(),
      restore,
    });
    self.insert_point = InsertPoint {
      module,
      block,
      at: None,
    };
    block
  }

  pub fn exit_cycle(&mut self) {
    let scope = self.current_ctx_mut().scopes.pop().expect("No scope to exit");
    assert!(
      matches!(scope.kind, ScopeKind::Cycle),
      "exit_cycle does not match the innermost scope"
    );
    assert_eq!(
      scope.block, self.insert_point.block,
      "exit_cycle while the insert point is elsewhere"
    );
    self.insert_point = scope.restore;
  }

  pub fn at_cycle<F: FnOnce(&mut SysBuilder)>(&mut self, cycle: usize, f: F) {
    self.enter_cycle(cycle);
    f(self);
    self.exit_cycle();
  }

  fn create_block(&mut self, kind: BlockKind) -> BaseNode {
    let parent = self.insert_point.block;
    let block = self.insert_element(Block::new(kind, parent));
    self.insert_at_ip(block);
    block
  }

  // ---------------------------------------------------------------------------
  // Modules and ports.

  fn create_module_impl(
    &mut self,
    name: &str,
    kind: ModuleKind,
    ports: Vec<PortInfo>,
  ) -> BaseNode {
    let n_ports = ports.len();
    let ports = ports
      .into_iter()
      .map(|x| self.insert_element(FIFO::new(x.ty, x.name.as_str())))
      .collect::<Vec<_>>();
    let module_name = self.identifier(name);
    let is_downstream = kind.is_downstream();
    let module = self.insert_element(Module::new(&module_name, kind, ports));
    // The port parents cannot be set before the module exists; patch them now.
    for i in 0..n_ports {
      let port = self.get::<Module>(&module).unwrap().get_port(i).unwrap().upcast();
      let port_name = {
        let port = port.as_ref::<FIFO>(self).unwrap();
        port.get_name().to_string()
      };
      let unique = {
        let mut module = module.as_mut::<Module>(self).unwrap();
        module.get_mut().symbol_table.identifier(&port_name)
      };
      assert_eq!(
        port_name, unique,
        "Port names of a module must be unique, got a second {}",
        port_name
      );
      let mut fifo = self.get_mut::<FIFO>(&port).unwrap();
      fifo.get_mut().set_parent(module);
      fifo.get_mut().set_idx(i);
    }
    let body = self.insert_element(Block::new(BlockKind::ModuleRoot, module));
    self.get_mut::<Module>(&module).unwrap().set_body(body);
    self.global_symbols.insert(module_name, module);
    if is_downstream {
      self.downstreams.push(module);
    } else {
      self.modules.push(module);
    }
    module
  }

  /// Create a sequential module with the given input ports.
  pub fn create_module(&mut self, name: &str, ports: Vec<PortInfo>) -> BaseNode {
    self.create_module_impl(name, ModuleKind::Sequential, ports)
  }

  /// Create a combinational module. It has no ports; it consumes values produced by
  /// other modules in the same cycle.
  pub fn create_downstream(&mut self, name: &str) -> BaseNode {
    self.create_module_impl(name, ModuleKind::Downstream, Vec::new())
  }

  // ---------------------------------------------------------------------------
  // Constants and arrays.

  /// Interned integer constant. Out-of-range values are a fatal error.
  pub fn get_const_int(&mut self, dtype: DataType, value: u64) -> BaseNode {
    assert!(
      dtype.inrange(value as i128),
      "{} is out of the range of {}",
      value,
      dtype.to_string()
    );
    self.get_const_raw(dtype, value)
  }

  /// Signed variant: the value is range-checked as a signed integer and stored as its
  /// two's complement bit pattern.
  pub fn get_const_signed(&mut self, dtype: DataType, value: i64) -> BaseNode {
    assert!(
      dtype.inrange(value as i128),
      "{} is out of the range of {}",
      value,
      dtype.to_string()
    );
    self.get_const_raw(dtype, value as u64)
  }

  fn get_const_raw(&mut self, dtype: DataType, value: u64) -> BaseNode {
    let key = CacheKey::IntImm(dtype.clone(), value);
    if let Some(cached) = self.cached_nodes.get(&key) {
      return *cached;
    }
    let node = self.insert_element(IntImm::new(dtype, value));
    self.cached_nodes.insert(key, node);
    node
  }

  fn get_str_imm(&mut self, value: &str) -> BaseNode {
    let key = CacheKey::StrImm(value.to_string());
    if let Some(cached) = self.cached_nodes.get(&key) {
      return *cached;
    }
    let node = self.insert_element(StrImm::new(value.to_string()));
    self.cached_nodes.insert(key, node);
    node
  }

  /// Declare a register array. Arrays are system-global; they are read and written
  /// from module bodies.
  pub fn create_array(
    &mut self,
    scalar_ty: DataType,
    name: &str,
    size: usize,
    init: Option<Vec<u64>>,
  ) -> BaseNode {
    let array_name = self.identifier(name);
    let array = self.insert_element(Array::new(scalar_ty, array_name.clone(), size, init));
    self.global_symbols.insert(array_name, array);
    self.arrays.push(array);
    array
  }

  /// Mark an array fully partitioned: every element becomes an independent register in
  /// the hardware lowering, so distinct writers of disjoint elements need no port
  /// conflict resolution.
  pub fn set_array_partitioned(&mut self, array: BaseNode) {
    array.as_mut::<Array>(self).unwrap().get_mut().set_partitioned();
  }

  // ---------------------------------------------------------------------------
  // Expression construction.

  /// The central expression constructor: validates operand ownership, wraps operands,
  /// maintains reverse user edges and module externals, tags the predicate carry, and
  /// inserts the node at the insert point.
  pub fn create_expr(
    &mut self,
    dtype: DataType,
    opcode: Opcode,
    operands: Vec<BaseNode>,
  ) -> BaseNode {
    let module = self.get_current_module_node();
    // Ownership rule: an expression operand from a foreign module is only legal in a
    // downstream (combinational) consumer.
    for value in operands.iter() {
      if let NodeKind::Expr = value.get_kind() {
        let owner = value.owner_module(self).unwrap();
        if owner != module {
          let is_downstream = self.get::<Module>(&module).unwrap().is_downstream();
          assert!(
            is_downstream,
            "{} is owned by module {}, but consumed in {}; only downstream modules may \
             consume foreign values",
            value.to_string(self),
            owner.to_string(self),
            module.to_string(self)
          );
        }
      }
    }
    if let Some(arity) = opcode.arity() {
      assert_eq!(
        arity,
        operands.len(),
        "{:?} expects {} operand(s), got {}",
        opcode,
        arity,
        operands.len()
      );
    }
    let meta_cond = self.current_carry();
    let block = self.insert_point.block;
    let expr = self.insert_element(Expr::new(dtype, opcode, Vec::new(), block, meta_cond));
    let mut wrapped = Vec::with_capacity(operands.len());
    for value in operands {
      let operand = self.insert_element(Operand::new(value));
      operand
        .as_mut::<Operand>(self)
        .unwrap()
        .get_mut()
        .set_user(expr);
      self.add_user(operand);
      self.record_external(module, value, operand);
      wrapped.push(operand);
    }
    expr.as_mut::<Expr>(self).unwrap().get_mut().operands = wrapped;
    self.insert_at_ip(expr)
  }

  /// Arrays, foreign modules, and foreign expressions all count as external interfaces
  /// of the consuming module.
  fn record_external(&mut self, module: BaseNode, value: BaseNode, operand: BaseNode) {
    let external = match value.get_kind() {
      NodeKind::Array | NodeKind::Module => true,
      NodeKind::Expr => value.owner_module(self).unwrap() != module,
      _ => false,
    };
    if external {
      self
        .get_mut::<Module>(&module)
        .unwrap()
        .add_external(value, operand);
    }
  }

  fn insert_at_ip(&mut self, node: BaseNode) -> BaseNode {
    let block = self.insert_point.block;
    let at = self.insert_point.at;
    let new_at = self.get_mut::<Block>(&block).unwrap().insert_at(at, node);
    self.insert_point.at = new_at;
    node
  }

  /// Result-type combination rules for binary arithmetic.
  fn combine_types(&self, binop: subcode::Binary, a: &BaseNode, b: &BaseNode) -> DataType {
    let aty = a.get_dtype(self).unwrap();
    let bty = b.get_dtype(self).unwrap();
    match binop {
      subcode::Binary::Add | subcode::Binary::Sub => match (&aty, &bty) {
        (DataType::Int(a), DataType::Int(b)) => DataType::Int(*a.max(b)),
        (DataType::UInt(a), DataType::UInt(b)) => DataType::UInt(*a.max(b)),
        _ => panic!(
          "Cannot combine types {} and {}",
          aty.to_string(),
          bty.to_string()
        ),
      },
      subcode::Binary::Mul => match (&aty, &bty) {
        (DataType::Int(a), DataType::Int(b)) => DataType::Int(a + b),
        (DataType::UInt(a), DataType::UInt(b)) => DataType::UInt(a + b),
        _ => panic!(
          "Cannot combine types {} and {}",
          aty.to_string(),
          bty.to_string()
        ),
      },
      subcode::Binary::Mod => aty.clone(),
      subcode::Binary::Shl | subcode::Binary::Shr => DataType::Bits(aty.get_bits()),
      subcode::Binary::BitwiseAnd | subcode::Binary::BitwiseOr | subcode::Binary::BitwiseXor => {
        DataType::Bits(aty.get_bits().max(bty.get_bits()))
      }
    }
  }

  pub fn create_binary(&mut self, binop: subcode::Binary, a: BaseNode, b: BaseNode) -> BaseNode {
    let dtype = self.combine_types(binop, &a, &b);
    self.create_expr(dtype, binop.into(), vec![a, b])
  }

  pub fn create_unary(&mut self, uop: subcode::Unary, x: BaseNode) -> BaseNode {
    let dtype = DataType::Bits(x.get_dtype(self).unwrap().get_bits());
    self.create_expr(dtype, uop.into(), vec![x])
  }

  pub fn create_compare(&mut self, cmp: subcode::Compare, a: BaseNode, b: BaseNode) -> BaseNode {
    self.create_expr(DataType::Bits(1), cmp.into(), vec![a, b])
  }

  pub fn create_select(&mut self, cond: BaseNode, t: BaseNode, f: BaseNode) -> BaseNode {
    let tty = t.get_dtype(self).unwrap();
    let fty = f.get_dtype(self).unwrap();
    assert!(
      tty.type_eq(&fty),
      "Select arms disagree: {} vs {}",
      tty.to_string(),
      fty.to_string()
    );
    self.create_expr(tty, Opcode::Select, vec![cond, t, f])
  }

  pub fn create_select_1hot(&mut self, cond: BaseNode, values: Vec<BaseNode>) -> BaseNode {
    assert!(!values.is_empty(), "select_1hot needs at least one value");
    let vty = values[0].get_dtype(self).unwrap();
    for value in values.iter().skip(1) {
      let ty = value.get_dtype(self).unwrap();
      assert!(
        vty.type_eq(&ty),
        "select_1hot arms disagree: {} vs {}",
        vty.to_string(),
        ty.to_string()
      );
    }
    let mut operands = vec![cond];
    operands.extend(values);
    self.create_expr(vty, Opcode::Select1Hot, operands)
  }

  pub fn create_slice(&mut self, x: BaseNode, l: usize, r: usize) -> BaseNode {
    assert!(l <= r, "Slice range [{}:{}] is inverted", l, r);
    let bits = x.get_dtype(self).unwrap().get_bits();
    assert!(r < bits, "Slice [{}:{}] exceeds the {} bits of the value", l, r, bits);
    let dtype = DataType::Bits(r - l + 1);
    let l = self.get_const_int(DataType::uint_ty(32), l as u64);
    let r = self.get_const_int(DataType::uint_ty(32), r as u64);
    self.create_expr(dtype, Opcode::Slice, vec![x, l, r])
  }

  pub fn create_concat(&mut self, msb: BaseNode, lsb: BaseNode) -> BaseNode {
    let bits =
      msb.get_dtype(self).unwrap().get_bits() + lsb.get_dtype(self).unwrap().get_bits();
    self.create_expr(DataType::Bits(bits), Opcode::Concat, vec![msb, lsb])
  }

  pub fn create_cast(&mut self, cast: subcode::Cast, x: BaseNode, dtype: DataType) -> BaseNode {
    let src_bits = x.get_dtype(self).unwrap().get_bits();
    match cast {
      subcode::Cast::Bitcast => assert_eq!(
        src_bits,
        dtype.get_bits(),
        "Bitcast cannot change the width"
      ),
      subcode::Cast::ZExt | subcode::Cast::SExt => assert!(
        dtype.get_bits() >= src_bits,
        "Extension cannot narrow {} bits to {}",
        src_bits,
        dtype.get_bits()
      ),
    }
    self.create_expr(dtype, cast.into(), vec![x])
  }

  /// Desugar a record field access into slice (+ bitcast for typed fields).
  pub fn get_record_field(&mut self, value: BaseNode, name: &str) -> BaseNode {
    let dtype = value.get_dtype(self).unwrap();
    let layout = match &dtype {
      DataType::Record(layout) => layout.clone(),
      _ => panic!("{} is not a record", dtype.to_string()),
    };
    let field = layout
      .field(name)
      .unwrap_or_else(|| panic!("Field {} not found in {}", name, dtype.to_string()))
      .clone();
    let sliced = self.create_slice(value, field.lsb, field.msb);
    if field.dtype.is_raw() {
      sliced
    } else {
      self.create_cast(subcode::Cast::Bitcast, sliced, field.dtype.clone())
    }
  }

  /// Bundle field values into a record-typed value. The layout must be fully covered.
  pub fn create_record_bundle(
    &mut self,
    layout: &RecordLayout,
    mut fields: Vec<(&str, BaseNode)>,
  ) -> BaseNode {
    assert!(!layout.is_readonly(), "Cannot bundle a readonly record");
    let mut ordered = Vec::new();
    for field in layout.field_iter() {
      let pos = fields
        .iter()
        .position(|(name, _)| *name == field.name)
        .unwrap_or_else(|| panic!("Field {} is not initialized", field.name));
      let (_, value) = fields.remove(pos);
      let vty = value.get_dtype(self).unwrap();
      assert_eq!(
        vty.get_bits(),
        field.dtype.get_bits(),
        "Field {} expects {} bits, got {}",
        field.name,
        field.dtype.get_bits(),
        vty.get_bits()
      );
      ordered.push((field.lsb, value));
    }
    assert!(fields.is_empty(), "Unknown fields given to the bundle");
    ordered.sort_by_key(|(lsb, _)| std::cmp::Reverse(*lsb));
    let mut res = ordered[0].1;
    for (_, value) in ordered.into_iter().skip(1) {
      res = self.create_concat(res, value);
    }
    self.create_cast(
      subcode::Cast::Bitcast,
      res,
      DataType::Record(layout.clone()),
    )
  }

  // ---------------------------------------------------------------------------
  // Array access.

  /// Read `array[idx]`. A read of the same (array, idx) already performed in the
  /// current or any enclosing scope is reused instead of re-emitted.
  pub fn create_array_read(&mut self, array: BaseNode, idx: BaseNode) -> BaseNode {
    assert_eq!(array.get_kind(), NodeKind::Array);
    let idx_ty = idx.get_dtype(self).unwrap();
    assert!(idx_ty.is_int(), "Array index must be an integer");
    let cache_key = (array, idx);
    let cached = self
      .current_ctx()
      .scopes
      .iter()
      .rev()
      .find_map(|x| x.read_cache.get(&cache_key).copied());
    if let Some(cached) = cached {
      return cached;
    }
    let dtype = self.get::<Array>(&array).unwrap().scalar_ty();
    let res = self.create_expr(dtype, Opcode::ArrayRead, vec![array, idx]);
    self
      .current_ctx_mut()
      .scopes
      .last_mut()
      .unwrap()
      .read_cache
      .insert(cache_key, res);
    res
  }

  /// The current module's write port into the array. Cached per (array, module); the
  /// first request registers the module in the array's writer list.
  pub fn write_port(&mut self, array: BaseNode) -> WritePort {
    let module = self.get_current_module_node();
    self.write_port_of(array, module)
  }

  pub fn write_port_of(&mut self, array: BaseNode, module: BaseNode) -> WritePort {
    assert_eq!(array.get_kind(), NodeKind::Array);
    assert_eq!(module.get_kind(), NodeKind::Module);
    let key = (array, module);
    if let Some(port) = self.write_ports.get(&key) {
      return *port;
    }
    array
      .as_mut::<Array>(self)
      .unwrap()
      .get_mut()
      .writers
      .push(module);
    let port = WritePort { array, module };
    self.write_ports.insert(key, port);
    port
  }

  /// Write `array[idx] <= value` from the current module, under the active predicate.
  pub fn create_array_write(
    &mut self,
    array: BaseNode,
    idx: BaseNode,
    value: BaseNode,
  ) -> BaseNode {
    let port = self.write_port(array);
    self.create_array_write_via(port, idx, value)
  }

  pub fn create_array_write_via(
    &mut self,
    port: WritePort,
    idx: BaseNode,
    value: BaseNode,
  ) -> BaseNode {
    let scalar_ty = self.get::<Array>(&port.array).unwrap().scalar_ty();
    let vty = value.get_dtype(self).unwrap();
    // A record-element array accepts a raw-bits value of the exact same width; any
    // other mismatch is a caller bug.
    let coercible =
      scalar_ty.is_record() && vty.is_raw() && scalar_ty.get_bits() == vty.get_bits();
    if !coercible && !scalar_ty.type_eq(&vty) {
      panic!(
        "Type mismatch in array write: array '{}' expects element type {}, but got {}",
        self.get::<Array>(&port.array).unwrap().get_name(),
        scalar_ty.to_string(),
        vty.to_string()
      );
    }
    self.create_expr(
      DataType::void(),
      Opcode::ArrayWrite,
      vec![port.array, idx, value, port.module],
    )
  }

  // ---------------------------------------------------------------------------
  // FIFO ports, binds and async calls.

  pub fn create_fifo_push(&mut self, fifo: BaseNode, value: BaseNode) -> BaseNode {
    let fifo_ty = self.get::<FIFO>(&fifo).unwrap().scalar_ty();
    let vty = value.get_dtype(self).unwrap();
    let coercible = fifo_ty.is_record() && vty.is_raw() && fifo_ty.get_bits() == vty.get_bits();
    assert!(
      coercible || fifo_ty.type_eq(&vty),
      "Type mismatch pushing {} into port {} of type {}",
      vty.to_string(),
      fifo.to_string(self),
      fifo_ty.to_string()
    );
    self.create_expr(DataType::void(), Opcode::FIFOPush, vec![fifo, value])
  }

  /// Pop the port's FIFO. Only the owning module may pop its own ports.
  pub fn create_fifo_pop(&mut self, fifo: BaseNode) -> BaseNode {
    let module = self.get_current_module_node();
    let (parent, dtype) = {
      let fifo = fifo.as_ref::<FIFO>(self).unwrap();
      (fifo.get_parent(), fifo.scalar_ty())
    };
    assert_eq!(
      parent,
      module,
      "Port {} belongs to {}, it cannot be popped from {}",
      fifo.to_string(self),
      parent.to_string(self),
      module.to_string(self)
    );
    self.create_expr(dtype, Opcode::FIFOPop, vec![fifo])
  }

  pub fn create_fifo_valid(&mut self, fifo: BaseNode) -> BaseNode {
    self.create_expr(
      DataType::Bits(1),
      subcode::FIFOField::Valid.into(),
      vec![fifo],
    )
  }

  pub fn create_fifo_peek(&mut self, fifo: BaseNode) -> BaseNode {
    let dtype = self.get::<FIFO>(&fifo).unwrap().scalar_ty();
    self.create_expr(dtype, subcode::FIFOField::Peek.into(), vec![fifo])
  }

  /// Whether the given module fired this cycle. Only meaningful in downstreams.
  pub fn create_triggered(&mut self, module: BaseNode) -> BaseNode {
    let current = self.get_current_module_node();
    assert!(
      self.get::<Module>(&current).unwrap().is_downstream(),
      "triggered() is only usable in downstream modules"
    );
    self.create_expr(DataType::Bits(1), Opcode::Triggered, vec![module])
  }

  /// Type-check every named argument against the callee's port set. Nothing is emitted
  /// unless all of them pass, so a failed bind leaves the IR untouched.
  fn check_bind_args(&self, callee: BaseNode, kvs: &[(&str, BaseNode)]) -> Vec<BaseNode> {
    let module = callee.as_ref::<Module>(self).unwrap();
    let mut ports = Vec::with_capacity(kvs.len());
    for (name, value) in kvs.iter() {
      let port = module
        .get_port_by_name(name)
        .unwrap_or_else(|| panic!("{} is not a port of {}", name, module.get_name()));
      let pty = port.scalar_ty();
      let vty = value.get_dtype(self).unwrap();
      let coercible = pty.is_record() && vty.is_raw() && pty.get_bits() == vty.get_bits();
      if !coercible && !pty.type_eq(&vty) {
        panic!(
          "Type mismatch binding port {}.{}: expected {}, but got {}",
          module.get_name(),
          name,
          pty.to_string(),
          vty.to_string()
        );
      }
      ports.push(port.upcast());
    }
    ports
  }

  /// Partially apply the callee's ports. The bind accumulates pushes; `async_called`
  /// finalizes it into an `AsyncCall`.
  pub fn create_bind(&mut self, callee: BaseNode, kvs: Vec<(&str, BaseNode)>) -> BaseNode {
    let ports = self.check_bind_args(callee, &kvs);
    let mut operands = vec![callee];
    for (port, (_, value)) in ports.into_iter().zip(kvs.into_iter()) {
      operands.push(self.create_fifo_push(port, value));
    }
    self.create_expr(DataType::void(), Opcode::Bind, operands)
  }

  /// Accumulate more arguments onto an existing bind.
  pub fn bind_arg(&mut self, bind: BaseNode, kvs: Vec<(&str, BaseNode)>) -> BaseNode {
    let callee = bind.as_inst::<Bind>(self).unwrap().callee().upcast();
    let ports = self.check_bind_args(callee, &kvs);
    for (port, (_, value)) in ports.into_iter().zip(kvs.into_iter()) {
      let push = self.create_fifo_push(port, value);
      let operand = self.insert_element(Operand::new(push));
      operand
        .as_mut::<Operand>(self)
        .unwrap()
        .get_mut()
        .set_user(bind);
      self.add_user(operand);
      bind
        .as_mut::<Expr>(self)
        .unwrap()
        .get_mut()
        .operands
        .push(operand);
    }
    bind
  }

  /// Record a FIFO depth hint on the push bound to the named port. Naming a port with
  /// no push is a fatal error.
  pub fn set_fifo_depth(&mut self, bind: BaseNode, name: &str, depth: usize) {
    let mut target = None;
    let mut available = Vec::new();
    {
      let bind = bind.as_inst::<Bind>(self).unwrap();
      for push in bind.push_iter() {
        let fifo = push.as_inst::<FIFOPush>(self).unwrap().fifo();
        available.push(fifo.get_name().to_string());
        if fifo.get_name() == name {
          target = Some(push);
        }
      }
    }
    let push = target.unwrap_or_else(|| {
      panic!(
        "No push found for FIFO named {}. Available FIFO names are: {:?}",
        name, available
      )
    });
    self.fifo_depths.insert(push, depth);
  }

  /// Finalize a bind into an async call: the sole mechanism by which one module
  /// schedules another's execution, always one cycle later.
  pub fn create_async_call(&mut self, bind: BaseNode) -> BaseNode {
    assert!(
      bind.as_inst::<Bind>(self).unwrap().is_fully_bound(),
      "Async call on a partially bound bind"
    );
    self.create_expr(DataType::void(), Opcode::AsyncCall, vec![bind])
  }

  // ---------------------------------------------------------------------------
  // Intrinsics and logging.

  pub fn create_wait_until(&mut self, cond: BaseNode) -> BaseNode {
    self.create_expr(
      DataType::void(),
      subcode::Intrinsic::WaitUntil.into(),
      vec![cond],
    )
  }

  pub fn create_finish(&mut self) -> BaseNode {
    self.create_expr(DataType::void(), subcode::Intrinsic::Finish.into(), vec![])
  }

  pub fn create_assert(&mut self, cond: BaseNode) -> BaseNode {
    self.create_expr(
      DataType::void(),
      subcode::Intrinsic::Assert.into(),
      vec![cond],
    )
  }

  pub fn create_barrier(&mut self, node: BaseNode) -> BaseNode {
    self.create_expr(
      DataType::void(),
      subcode::Intrinsic::Barrier.into(),
      vec![node],
    )
  }

  pub fn create_log(&mut self, fmt: &str, args: Vec<BaseNode>) -> BaseNode {
    let fmt = self.get_str_imm(fmt);
    let mut operands = vec![fmt];
    operands.extend(args);
    self.create_expr(DataType::void(), Opcode::Log, operands)
  }

  /// Syntactic sugar: wait until every port of the current module has data.
  pub fn validate_all_ports(&mut self) -> BaseNode {
    let ports = {
      let module = self.get_current_module().unwrap();
      module.port_iter().map(|x| x.upcast()).collect::<Vec<_>>()
    };
    assert!(!ports.is_empty(), "validate_all_ports on a module with no ports");
    let mut valid = None;
    for port in ports {
      let v = self.create_fifo_valid(port);
      valid = Some(match valid {
        None => v,
        Some(prev) => self.create_binary(subcode::Binary::BitwiseAnd, prev, v),
      });
    }
    self.create_wait_until(valid.unwrap())
  }

  /// Pop every port of the current module, fixing the timing policy: validating first
  /// makes the module backpressured, popping blindly makes it systolic.
  pub fn pop_all_ports(&mut self, validate: bool) -> Vec<BaseNode> {
    let module = self.get_current_module_node();
    if validate {
      self.validate_all_ports();
    }
    {
      let mut module = module.as_mut::<Module>(self).unwrap();
      module.set_timing(if validate {
        Timing::Backpressure
      } else {
        Timing::Systolic
      });
    }
    let ports = {
      let module = self.get::<Module>(&module).unwrap();
      module.port_iter().map(|x| x.upcast()).collect::<Vec<_>>()
    };
    ports
      .into_iter()
      .map(|port| self.create_fifo_pop(port))
      .collect()
  }

  // ---------------------------------------------------------------------------
  // Memory modules.

  /// An SRAM: a downstream owning a hidden payload array and a 1-deep read register.
  /// `we/re/addr/wdata` are values produced by the surrounding modules. Returns
  /// (module, rdata array).
  pub fn create_sram(
    &mut self,
    name: &str,
    width: usize,
    depth: usize,
    init_file: Option<String>,
    we: BaseNode,
    re: BaseNode,
    addr: BaseNode,
    wdata: BaseNode,
  ) -> (BaseNode, BaseNode) {
    let params = MemoryParams::new(width, depth, init_file);
    let ty = DataType::Bits(width);
    let payload = self.create_array(ty.clone(), &format!("{}_val", name), depth, None);
    let rdata = self.create_array(ty, &format!("{}_rdata", name), 1, None);
    let module = self.create_module_impl(name, ModuleKind::Sram(params), Vec::new());
    self.enter_module(module);
    {
      // Read and write may not fire together.
      let both = self.create_binary(subcode::Binary::BitwiseAnd, we, re);
      let neither = self.create_unary(subcode::Unary::Flip, both);
      self.create_assert(neither);
      self.in_condition(we, |sys| {
        sys.create_array_write(payload, addr, wdata);
      });
      let zero = self.get_const_int(DataType::uint_ty(1), 0);
      self.in_condition(re, |sys| {
        let data = sys.create_array_read(payload, addr);
        sys.create_array_write(rdata, zero, data);
      });
    }
    self.exit_module();
    (module, rdata)
  }

  /// A DRAM model: a downstream that forwards guarded read/write requests to the
  /// external memory-timing shim. Returns the module.
  pub fn create_dram(
    &mut self,
    name: &str,
    width: usize,
    depth: usize,
    init_file: Option<String>,
    we: BaseNode,
    re: BaseNode,
    addr: BaseNode,
    wdata: BaseNode,
  ) -> BaseNode {
    let params = MemoryParams::new(width, depth, init_file);
    let module = self.create_module_impl(name, ModuleKind::Dram(params), Vec::new());
    self.enter_module(module);
    {
      self.in_condition(re, |sys| {
        sys.create_expr(
          DataType::Bits(1),
          subcode::Intrinsic::SendReadRequest.into(),
          vec![addr],
        );
      });
      self.in_condition(we, |sys| {
        sys.create_expr(
          DataType::Bits(1),
          subcode::Intrinsic::SendWriteRequest.into(),
          vec![addr, wdata],
        );
      });
    }
    self.exit_module();
    module
  }

  /// Whether the DRAM has a response ready this cycle.
  pub fn create_has_mem_resp(&mut self, dram: BaseNode) -> BaseNode {
    self.create_expr(
      DataType::Bits(1),
      subcode::Intrinsic::HasMemResp.into(),
      vec![dram],
    )
  }

  /// The DRAM response payload.
  pub fn create_mem_resp(&mut self, dram: BaseNode) -> BaseNode {
    let width = {
      let module = dram.as_ref::<Module>(self).unwrap();
      module
        .get_kind()
        .memory_params()
        .expect("mem_resp expects a memory module")
        .width
    };
    self.create_expr(
      DataType::Bits(width),
      subcode::Intrinsic::MemResp.into(),
      vec![dram],
    )
  }
}
