use crate::ir::DataType;

pub(crate) fn namify(name: &str) -> String {
  name.replace('.', "_")
}

/// Map an IR type onto the Rust type the generated simulator computes in. Records are
/// raw bit vectors; anything wider than 64 bits falls back to big integers.
pub(crate) fn dtype_to_rust_type(dtype: &DataType) -> String {
  let dtype = if let DataType::Record(layout) = dtype {
    DataType::Bits(layout.get_bits())
  } else {
    dtype.clone()
  };
  if dtype.is_int() || dtype.is_raw() {
    let prefix = if dtype.is_signed() { "i" } else { "u" };
    let bits = dtype.get_bits();
    return if bits == 1 {
      "bool".to_string()
    } else if bits <= 8 {
      format!("{}8", prefix)
    } else if bits <= 64 {
      format!("{}{}", prefix, bits.next_power_of_two())
    } else if dtype.is_signed() {
      "BigInt".to_string()
    } else {
      "BigUint".to_string()
    };
  }
  match &dtype {
    DataType::ArrayType(ty, size) => format!("[{}; {}]", dtype_to_rust_type(ty), size),
    _ => panic!("No Rust type for {}", dtype.to_string()),
  }
}

pub(crate) fn int_imm_dumper_impl(ty: &DataType, value: u64) -> String {
  if ty.get_bits() == 1 {
    return if value == 0 { "false" } else { "true" }.to_string();
  }
  if ty.get_bits() <= 64 {
    if ty.is_signed() {
      format!("{}{}", value as i64, dtype_to_rust_type(ty))
    } else {
      format!("{}{}", value, dtype_to_rust_type(ty))
    }
  } else {
    let scalar_ty = if ty.is_signed() { "i64" } else { "u64" };
    format!(
      "ValueCastTo::<{}>::cast(&({} as {}))",
      dtype_to_rust_type(ty),
      value,
      scalar_ty
    )
  }
}
