use std::collections::HashMap;

/// Uniquifies identifiers within one namespace. The first request for a name returns it
/// verbatim; collisions get a numeric suffix. Deterministic given request order.
pub struct SymbolTable {
  ids: HashMap<String, usize>,
}

impl SymbolTable {
  pub fn new() -> Self {
    Self {
      ids: HashMap::new(),
    }
  }

  pub fn identifier(&mut self, id: &str) -> String {
    if let Some(n) = self.ids.get_mut(id) {
      *n += 1;
      let res = format!("{}_{}", id, n);
      // Reserve the suffixed form too, so a user-given "add_1" never collides.
      self.ids.insert(res.clone(), 0);
      return res;
    }
    self.ids.insert(id.to_string(), 0);
    id.to_string()
  }
}

impl Default for SymbolTable {
  fn default() -> Self {
    Self::new()
  }
}
