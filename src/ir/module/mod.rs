pub mod attrs;

use std::collections::HashSet;

use linked_hash_map::LinkedHashMap;

use crate::builder::symbol_table::SymbolTable;
use crate::ir::node::*;
use crate::ir::*;

pub use attrs::{MemoryParams, Timing};

use super::block::Block;
use super::port::FIFO;

/// What flavor of hardware a module lowers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleKind {
  /// A clocked module triggered through its event/trigger-counter.
  Sequential,
  /// A combinational module re-evaluated whenever any upstream fires.
  Downstream,
  /// A downstream owning an SRAM payload.
  Sram(MemoryParams),
  /// A downstream issuing DRAM requests through the memory-model shim.
  Dram(MemoryParams),
}

impl ModuleKind {
  pub fn is_downstream(&self) -> bool {
    !matches!(self, ModuleKind::Sequential)
  }

  pub fn memory_params(&self) -> Option<&MemoryParams> {
    match self {
      ModuleKind::Sram(params) | ModuleKind::Dram(params) => Some(params),
      _ => None,
    }
  }
}

pub struct Module {
  pub(crate) key: usize,
  name: String,
  kind: ModuleKind,
  ports: Vec<BaseNode>,
  body: BaseNode,
  /// Values defined elsewhere but consumed here: arrays, foreign FIFOs (push targets),
  /// and foreign expressions (downstream-only). Iteration order is insertion order so
  /// generated port lists are deterministic.
  pub(crate) externals: LinkedHashMap<BaseNode, Vec<BaseNode>>,
  timing: Option<Timing>,
  no_arbiter: bool,
  pub(crate) user_set: HashSet<BaseNode>,
  pub(crate) symbol_table: SymbolTable,
}

impl Module {
  pub(crate) fn new(name: &str, kind: ModuleKind, ports: Vec<BaseNode>) -> Self {
    Self {
      key: 0,
      name: name.to_string(),
      kind,
      ports,
      body: BaseNode::unknown(),
      externals: LinkedHashMap::new(),
      timing: None,
      no_arbiter: false,
      user_set: HashSet::new(),
      symbol_table: SymbolTable::new(),
    }
  }

  pub fn get_name(&self) -> &str {
    self.name.as_str()
  }

  pub fn get_kind(&self) -> &ModuleKind {
    &self.kind
  }

  pub fn is_downstream(&self) -> bool {
    self.kind.is_downstream()
  }

  pub fn get_timing(&self) -> Option<Timing> {
    self.timing
  }

  pub fn is_systolic(&self) -> bool {
    self.timing == Some(Timing::Systolic)
  }

  pub fn no_arbiter(&self) -> bool {
    self.no_arbiter
  }

  pub fn set_no_arbiter(&mut self) {
    self.no_arbiter = true;
  }

  pub fn get_num_ports(&self) -> usize {
    self.ports.len()
  }
}

impl<'sys> ModuleRef<'sys> {
  pub fn get_port(&self, i: usize) -> Option<FIFORef<'_>> {
    self
      .get()
      .ports
      .get(i)
      .map(|x| x.as_ref::<FIFO>(self.sys).unwrap())
  }

  pub fn get_port_by_name(&self, name: &str) -> Option<FIFORef<'_>> {
    self
      .get()
      .ports
      .iter()
      .find(|x| self.sys.get::<FIFO>(x).unwrap().get_name() == name)
      .map(|x| x.as_ref::<FIFO>(self.sys).unwrap())
  }

  pub fn port_iter(&self) -> impl Iterator<Item = FIFORef<'_>> {
    self
      .get()
      .ports
      .iter()
      .map(|x| x.as_ref::<FIFO>(self.sys).unwrap())
  }

  pub fn get_body<'elem>(&self) -> BlockRef<'elem>
  where
    'sys: 'elem,
  {
    self.get().body.as_ref::<Block>(self.sys).unwrap()
  }

  /// External interfaces in insertion order.
  pub fn ext_iter(&self) -> impl Iterator<Item = (&BaseNode, &Vec<BaseNode>)> {
    self.get().externals.iter()
  }

  pub fn users(&self) -> &HashSet<BaseNode> {
    &self.get().user_set
  }

  /// The signature of this module as a data type, one entry per port.
  pub fn signature(&self) -> DataType {
    let types = self.port_iter().map(|x| x.scalar_ty()).collect::<Vec<_>>();
    DataType::module(types)
  }
}

impl ModuleMut<'_> {
  pub(crate) fn set_body(&mut self, body: BaseNode) {
    self.get_mut().body = body;
  }

  /// Record an external interface usage. Arrays, foreign FIFOs, and foreign
  /// expressions all land here.
  pub(crate) fn add_external(&mut self, value: BaseNode, operand: BaseNode) {
    self
      .get_mut()
      .externals
      .entry(value)
      .or_insert_with(Vec::new)
      .push(operand);
  }

  /// The timing policy is a one-shot decision.
  pub fn set_timing(&mut self, timing: Timing) {
    let module = self.get();
    assert!(
      module.timing.is_none(),
      "Timing policy of {} is already set to {}; cannot set it twice",
      module.get_name(),
      module.timing.unwrap().to_str()
    );
    self.get_mut().timing = Some(timing);
  }

  pub fn set_name(&mut self, name: String) {
    self.get_mut().name = name;
  }
}
