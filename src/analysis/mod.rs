// Post-construction, read-only analyses. Both backends consume one `Analysis`
// snapshot, so they cannot disagree on triggering order, port allocation, or
// external usage.

pub mod external_usage;
pub mod interact;
pub mod port_alloc;
pub mod topo;

pub use external_usage::{downstream_dependencies, expr_externally_used, get_upstreams};
pub use interact::{collect_interactions, InteractionMatrix, ModuleRecord};
pub use port_alloc::PortAllocation;
pub use topo::topo_downstream_modules;

use crate::builder::SysBuilder;
use crate::ir::node::BaseNode;

/// One frozen analysis snapshot over a fully built system.
pub struct Analysis {
  /// Downstream modules in evaluation order.
  pub topo: Vec<BaseNode>,
  pub matrix: InteractionMatrix,
  pub ports: PortAllocation,
}

impl Analysis {
  pub fn of(sys: &SysBuilder) -> Self {
    let topo = topo_downstream_modules(sys);
    let matrix = collect_interactions(sys);
    let ports = PortAllocation::of(sys);
    Self {
      topo,
      matrix,
      ports,
    }
  }
}
