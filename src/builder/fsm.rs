use std::collections::HashMap;

use crate::builder::SysBuilder;
use crate::ir::expr::subcode;
use crate::ir::node::*;
use crate::ir::*;

/// Finite-state-machine sugar: a table of `state -> [(condition, next-state)]`
/// transitions over a 1-element state register, desugared into nested condition
/// blocks. The per-state actions are closures invoked inside the state's scope.
pub struct Fsm {
  state_reg: BaseNode,
  states: Vec<(String, Vec<(BaseNode, String)>)>,
  state_map: HashMap<String, u64>,
  state_bits: usize,
}

impl Fsm {
  pub fn new(state_reg: BaseNode, transitions: Vec<(&str, Vec<(BaseNode, &str)>)>) -> Self {
    assert!(!transitions.is_empty(), "An FSM needs at least one state");
    let n = transitions.len();
    let state_bits = (usize::BITS - (n - 1).leading_zeros()).max(1) as usize;
    let mut state_map = HashMap::new();
    let states = transitions
      .into_iter()
      .enumerate()
      .map(|(i, (name, edges))| {
        assert!(
          state_map.insert(name.to_string(), i as u64).is_none(),
          "Duplicate FSM state {}",
          name
        );
        let edges = edges
          .into_iter()
          .map(|(cond, next)| (cond, next.to_string()))
          .collect();
        (name.to_string(), edges)
      })
      .collect();
    Self {
      state_reg,
      states,
      state_map,
      state_bits,
    }
  }

  pub fn state_bits(&self) -> usize {
    self.state_bits
  }

  /// The encoded value of a state name.
  pub fn state_value(&self, name: &str) -> u64 {
    *self
      .state_map
      .get(name)
      .unwrap_or_else(|| panic!("Unknown FSM state {}", name))
  }

  /// Desugar the table. For every state: a condition scope comparing the state
  /// register, the state's action inside it, and one nested condition per transition
  /// writing the next state.
  pub fn generate<F>(&self, sys: &mut SysBuilder, mut action: F)
  where
    F: FnMut(&mut SysBuilder, &str),
  {
    let ty = DataType::Bits(self.state_bits);
    let zero = sys.get_const_int(DataType::uint_ty(1), 0);
    let current = sys.create_array_read(self.state_reg, zero);
    for (name, edges) in self.states.iter() {
      let encoding = sys.get_const_int(ty.clone(), self.state_value(name));
      let in_state = sys.create_compare(subcode::Compare::EQ, current, encoding);
      sys.enter_condition(in_state);
      action(sys, name.as_str());
      for (cond, next) in edges.iter() {
        let next = sys.get_const_int(ty.clone(), self.state_value(next));
        sys.in_condition(*cond, |sys| {
          sys.create_array_write(self.state_reg, zero, next);
        });
      }
      sys.exit_condition();
    }
  }
}
