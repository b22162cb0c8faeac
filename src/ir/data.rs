use crate::ir::node::*;

/// A named bit range inside a `Record` layout. `lsb..=msb`, both inclusive.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RecordField {
  pub name: String,
  pub dtype: DataType,
  pub lsb: usize,
  pub msb: usize,
}

/// The field layout of a record type. Fields are kept in declaration order.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct RecordLayout {
  fields: Vec<RecordField>,
  bits: usize,
  readonly: bool,
}

impl RecordLayout {
  /// Build a densely packed layout. Fields are given msb-to-lsb; offsets are accumulated
  /// from bit 0 upwards, so the last field of the list lands at the lsb.
  pub fn packed(fields: Vec<(String, DataType)>) -> Self {
    assert!(!fields.is_empty(), "No fields provided for Record");
    let mut laid = Vec::with_capacity(fields.len());
    let mut bits = 0;
    for (name, dtype) in fields.into_iter().rev() {
      let width = dtype.get_bits();
      laid.push(RecordField {
        name,
        dtype,
        lsb: bits,
        msb: bits + width - 1,
      });
      bits += width;
    }
    laid.reverse();
    Self {
      fields: laid,
      bits,
      readonly: false,
    }
  }

  /// Build a layout with explicit bit ranges. Overlapping fields are a fatal error;
  /// uncovered holes mark the layout read-only (it can be viewed but not bundled).
  pub fn sparse(fields: Vec<(usize, usize, String, DataType)>) -> Self {
    assert!(!fields.is_empty(), "No fields provided for Record");
    let mut laid = Vec::with_capacity(fields.len());
    let mut bits = 0;
    for (start, end, name, dtype) in fields {
      assert!(start <= end, "Field {} has an inverted range", name);
      assert_eq!(
        dtype.get_bits(),
        end - start + 1,
        "Field {} does not fit its [{}, {}] range",
        name,
        start,
        end
      );
      bits = bits.max(end + 1);
      laid.push(RecordField {
        name,
        dtype,
        lsb: start,
        msb: end,
      });
    }
    let mut mask: Vec<Option<&str>> = vec![None; bits];
    for field in laid.iter() {
      for bit in field.lsb..=field.msb {
        if let Some(prev) = mask[bit] {
          panic!("Field {} and {} overlap at bit {}", prev, field.name, bit);
        }
        mask[bit] = Some(field.name.as_str());
      }
    }
    let readonly = mask.iter().any(|x| x.is_none());
    Self {
      fields: laid,
      bits,
      readonly,
    }
  }

  pub fn get_bits(&self) -> usize {
    self.bits
  }

  pub fn is_readonly(&self) -> bool {
    self.readonly
  }

  pub fn field(&self, name: &str) -> Option<&RecordField> {
    self.fields.iter().find(|x| x.name == name)
  }

  pub fn field_iter(&self) -> impl Iterator<Item = &RecordField> {
    self.fields.iter()
  }

  fn layout_eq(&self, other: &RecordLayout) -> bool {
    self.bits == other.bits
      && self.fields.len() == other.fields.len()
      && self.fields.iter().all(|a| {
        other.field(&a.name).is_some_and(|b| {
          a.lsb == b.lsb && a.msb == b.msb && a.dtype.type_eq(&b.dtype)
        })
      })
  }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum DataType {
  Void,
  Int(usize),
  UInt(usize),
  Bits(usize),
  Str,
  Record(RecordLayout),
  Module(Vec<Box<DataType>>),
  ArrayType(Box<DataType>, usize),
}

pub trait Typed {
  fn dtype(&self) -> DataType;
}

impl DataType {
  pub fn void() -> Self {
    DataType::Void
  }

  pub fn int_ty(bits: usize) -> Self {
    DataType::Int(bits)
  }

  /// Unsigned integers are at least one bit wide.
  pub fn uint_ty(bits: usize) -> Self {
    DataType::UInt(bits.max(1))
  }

  pub fn bits_ty(bits: usize) -> Self {
    DataType::Bits(bits)
  }

  pub fn record(layout: RecordLayout) -> Self {
    DataType::Record(layout)
  }

  pub fn module(inputs: Vec<DataType>) -> Self {
    DataType::Module(inputs.into_iter().map(Box::new).collect())
  }

  pub fn array(scalar_ty: DataType, size: usize) -> Self {
    assert!(scalar_ty.is_scalar(), "Array elements must be scalar");
    DataType::ArrayType(Box::new(scalar_ty), size)
  }

  pub fn get_bits(&self) -> usize {
    match self {
      DataType::Void | DataType::Str | DataType::Module(_) => 0,
      DataType::Int(bits) | DataType::UInt(bits) | DataType::Bits(bits) => *bits,
      DataType::Record(layout) => layout.get_bits(),
      DataType::ArrayType(ty, size) => ty.get_bits() * size,
    }
  }

  pub fn is_scalar(&self) -> bool {
    matches!(
      self,
      DataType::Int(_) | DataType::UInt(_) | DataType::Bits(_) | DataType::Record(_)
    )
  }

  pub fn is_int(&self) -> bool {
    matches!(self, DataType::Int(_) | DataType::UInt(_))
  }

  pub fn is_signed(&self) -> bool {
    matches!(self, DataType::Int(_))
  }

  pub fn is_raw(&self) -> bool {
    matches!(self, DataType::Bits(_))
  }

  pub fn is_record(&self) -> bool {
    matches!(self, DataType::Record(_))
  }

  pub fn is_void(&self) -> bool {
    matches!(self, DataType::Void)
  }

  /// Strict type equality: same class, same width, and for records the same field
  /// layout, recursively.
  pub fn type_eq(&self, other: &DataType) -> bool {
    match (self, other) {
      (DataType::Record(a), DataType::Record(b)) => a.layout_eq(b),
      (DataType::ArrayType(a, n), DataType::ArrayType(b, m)) => n == m && a.type_eq(b),
      _ => self == other,
    }
  }

  /// Whether the raw integer is representable in this type.
  pub fn inrange(&self, value: i128) -> bool {
    match self {
      DataType::Int(bits) => {
        if *bits >= 128 {
          return true;
        }
        let left = -(1i128 << (bits - 1));
        let right = (1i128 << (bits - 1)) - 1;
        left <= value && value <= right
      }
      DataType::UInt(_) | DataType::Bits(_) | DataType::Record(_) => {
        let bits = self.get_bits();
        if value < 0 {
          return false;
        }
        if bits >= 128 {
          return true;
        }
        value < (1i128 << bits)
      }
      _ => false,
    }
  }
}

impl ToString for DataType {
  fn to_string(&self) -> String {
    match self {
      DataType::Void => "()".into(),
      DataType::Int(bits) => format!("i{}", bits),
      DataType::UInt(bits) => format!("u{}", bits),
      DataType::Bits(bits) => format!("b{}", bits),
      DataType::Str => "str".into(),
      DataType::Record(layout) => {
        let fields = layout
          .field_iter()
          .map(|x| format!("{}: {}", x.name, x.dtype.to_string()))
          .collect::<Vec<_>>()
          .join(", ");
        format!("record {{ {} }}", fields)
      }
      DataType::Module(args) => {
        let args = args.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(", ");
        format!("module[{}]", args)
      }
      DataType::ArrayType(ty, size) => format!("[{}; {}]", ty.to_string(), size),
    }
  }
}

/// An immutable integer constant. Interned per builder by (dtype, value).
pub struct IntImm {
  pub(crate) key: usize,
  dtype: DataType,
  value: u64,
}

impl IntImm {
  pub(crate) fn new(dtype: DataType, value: u64) -> Self {
    Self {
      key: 0,
      dtype,
      value,
    }
  }

  pub fn get_value(&self) -> u64 {
    self.value
  }
}

impl Typed for IntImm {
  fn dtype(&self) -> DataType {
    self.dtype.clone()
  }
}

/// A string immediate. Only legal as a log format string.
pub struct StrImm {
  pub(crate) key: usize,
  value: String,
}

impl StrImm {
  pub(crate) fn new(value: String) -> Self {
    Self { key: 0, value }
  }

  pub fn get_value(&self) -> &str {
    self.value.as_str()
  }
}

impl Typed for StrImm {
  fn dtype(&self) -> DataType {
    DataType::Str
  }
}

/// A register array. Reads happen through `ArrayRead` expressions, writes through
/// `ArrayWrite` expressions tagged with the writing module.
pub struct Array {
  pub(crate) key: usize,
  name: String,
  scalar_ty: DataType,
  size: usize,
  init: Option<Vec<u64>>,
  partitioned: bool,
  /// Modules writing this array, in first-write registration order. This order is the
  /// write-port allocation order, and thereby the same-cycle write tie-break.
  pub(crate) writers: Vec<BaseNode>,
  pub(crate) user_set: std::collections::HashSet<BaseNode>,
}

impl Array {
  pub(crate) fn new(
    scalar_ty: DataType,
    name: String,
    size: usize,
    init: Option<Vec<u64>>,
  ) -> Self {
    if let Some(init) = &init {
      assert_eq!(init.len(), size, "Initializer size mismatch for array {}", name);
      for value in init.iter() {
        assert!(
          scalar_ty.inrange(*value as i128),
          "Initializer {} out of range of {}",
          value,
          scalar_ty.to_string()
        );
      }
    }
    Self {
      key: 0,
      name,
      scalar_ty,
      size,
      init,
      partitioned: false,
      writers: Vec::new(),
      user_set: std::collections::HashSet::new(),
    }
  }

  pub fn get_name(&self) -> &str {
    self.name.as_str()
  }

  pub fn get_size(&self) -> usize {
    self.size
  }

  pub fn scalar_ty(&self) -> DataType {
    self.scalar_ty.clone()
  }

  pub fn get_initializer(&self) -> Option<&Vec<u64>> {
    self.init.as_ref()
  }

  pub fn is_partitioned(&self) -> bool {
    self.partitioned
  }

  pub(crate) fn set_partitioned(&mut self) {
    self.partitioned = true;
  }

  /// The number of bits needed to index this array.
  pub fn index_bits(&self) -> usize {
    let is_p2 = self.size & (self.size.wrapping_sub(1)) == 0;
    let res = usize::BITS as usize - self.size.leading_zeros() as usize - (is_p2 as usize);
    res.max(1)
  }

  pub fn index_ty(&self) -> DataType {
    DataType::uint_ty(self.index_bits())
  }

  /// Writer modules in registration order.
  pub fn writer_iter(&self) -> impl Iterator<Item = &BaseNode> {
    self.writers.iter()
  }
}

impl Typed for Array {
  fn dtype(&self) -> DataType {
    DataType::array(self.scalar_ty.clone(), self.size)
  }
}

impl ArrayMut<'_> {
  pub fn set_name(&mut self, name: String) {
    let name = self.sys.identifier(&name);
    self.get_mut().name = name;
  }
}
