use std::collections::HashMap;

use linked_hash_map::LinkedHashMap;

use crate::builder::SysBuilder;
use crate::ir::instructions::ArrayRead;
use crate::ir::node::*;
use crate::ir::visitor::Visitor;
use crate::ir::*;

/// Physical array-port assignment, shared by both backends.
///
/// Write ports: one per distinct (array, writing module), indexed in the array's
/// writer-registration order. The index doubles as the same-cycle write priority:
/// the highest index wins ties in both lowerings.
///
/// Read ports: one per `ArrayRead` site (not per module), indexed in IR walk order.
pub struct PortAllocation {
  write_ports: HashMap<(BaseNode, BaseNode), usize>,
  write_counts: HashMap<BaseNode, usize>,
  read_ports: HashMap<BaseNode, usize>,
  reads_of: LinkedHashMap<BaseNode, Vec<BaseNode>>,
}

impl PortAllocation {
  pub fn of(sys: &SysBuilder) -> Self {
    let mut res = Self {
      write_ports: HashMap::new(),
      write_counts: HashMap::new(),
      read_ports: HashMap::new(),
      reads_of: LinkedHashMap::new(),
    };
    for array in sys.array_iter() {
      let array_node = array.upcast();
      res.reads_of.insert(array_node, Vec::new());
      for (i, writer) in array.writer_iter().enumerate() {
        res.write_ports.insert((array_node, *writer), i);
      }
      res.write_counts.insert(array_node, array.writer_iter().count());
    }
    let mut reader = ReadCollector { alloc: &mut res };
    reader.enter(sys);
    res
  }

  /// The write port of the module into the array.
  pub fn write_port(&self, array: &BaseNode, module: &BaseNode) -> Option<usize> {
    self.write_ports.get(&(*array, *module)).copied()
  }

  /// The number of physical write ports the array needs. At least one so that even a
  /// read-only array has a well-formed hardware shell.
  pub fn write_port_count(&self, array: &BaseNode) -> usize {
    self.write_counts.get(array).copied().unwrap_or(0).max(1)
  }

  /// The number of distinct writing modules.
  pub fn num_writers(&self, array: &BaseNode) -> usize {
    self.write_counts.get(array).copied().unwrap_or(0)
  }

  /// The read port of one `ArrayRead` site.
  pub fn read_port(&self, read: &BaseNode) -> Option<usize> {
    self.read_ports.get(read).copied()
  }

  /// All read sites of an array, in port order.
  pub fn reads_of(&self, array: &BaseNode) -> &[BaseNode] {
    self.reads_of.get(array).map(|x| x.as_slice()).unwrap_or(&[])
  }
}

struct ReadCollector<'a> {
  alloc: &'a mut PortAllocation,
}

impl Visitor<()> for ReadCollector<'_> {
  fn visit_expr(&mut self, expr: &ExprRef<'_>) -> Option<()> {
    if let Opcode::ArrayRead = expr.get_opcode() {
      let node = expr.get().upcast();
      let array = node.as_inst::<ArrayRead>(expr.sys).unwrap().array_node();
      let sites = self.alloc.reads_of.entry(array).or_insert_with(Vec::new);
      let port = sites.len();
      sites.push(node);
      self.alloc.read_ports.insert(node, port);
    }
    None
  }
}
