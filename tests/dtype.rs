use eventide::builder::SysBuilder;
use eventide::ir::{DataType, IntImm, RecordLayout, Typed};

#[test]
fn int_ranges() {
  let i8t = DataType::int_ty(8);
  assert!(i8t.inrange(127));
  assert!(i8t.inrange(-128));
  assert!(!i8t.inrange(128));
  assert!(!i8t.inrange(-129));

  let u4 = DataType::uint_ty(4);
  assert!(u4.inrange(0));
  assert!(u4.inrange(15));
  assert!(!u4.inrange(16));
  assert!(!u4.inrange(-1));

  let b1 = DataType::bits_ty(1);
  assert!(b1.inrange(1));
  assert!(!b1.inrange(2));
}

#[test]
fn uint_is_at_least_one_bit() {
  assert_eq!(DataType::uint_ty(0).get_bits(), 1);
}

#[test]
fn const_round_trip() {
  let mut sys = SysBuilder::new("consts");
  let a = sys.get_const_int(DataType::uint_ty(16), 1440);
  let imm = a.as_ref::<IntImm>(&sys).unwrap();
  assert_eq!(imm.get_value(), 1440);
  assert_eq!(imm.dtype(), DataType::uint_ty(16));
}

#[test]
fn consts_are_interned() {
  let mut sys = SysBuilder::new("consts");
  let a = sys.get_const_int(DataType::uint_ty(8), 42);
  let b = sys.get_const_int(DataType::uint_ty(8), 42);
  let c = sys.get_const_int(DataType::uint_ty(9), 42);
  assert_eq!(a, b);
  assert_ne!(a, c);
}

#[test]
#[should_panic(expected = "out of the range")]
fn out_of_range_const_panics() {
  let mut sys = SysBuilder::new("consts");
  sys.get_const_int(DataType::uint_ty(4), 16);
}

#[test]
fn type_equality_is_strict() {
  assert!(DataType::uint_ty(8).type_eq(&DataType::uint_ty(8)));
  assert!(!DataType::uint_ty(8).type_eq(&DataType::bits_ty(8)));
  assert!(!DataType::uint_ty(8).type_eq(&DataType::uint_ty(9)));
  assert!(!DataType::int_ty(8).type_eq(&DataType::uint_ty(8)));
}

#[test]
fn packed_record_layout() {
  // Fields are declared msb-to-lsb; the last one sits at the lsb.
  let layout = RecordLayout::packed(vec![
    ("opcode".into(), DataType::bits_ty(4)),
    ("operand".into(), DataType::uint_ty(12)),
  ]);
  assert_eq!(layout.get_bits(), 16);
  assert!(!layout.is_readonly());
  let operand = layout.field("operand").unwrap();
  assert_eq!((operand.lsb, operand.msb), (0, 11));
  let opcode = layout.field("opcode").unwrap();
  assert_eq!((opcode.lsb, opcode.msb), (12, 15));
}

#[test]
fn sparse_record_with_hole_is_readonly() {
  let layout = RecordLayout::sparse(vec![
    (0, 3, "lo".into(), DataType::bits_ty(4)),
    (8, 15, "hi".into(), DataType::bits_ty(8)),
  ]);
  assert_eq!(layout.get_bits(), 16);
  assert!(layout.is_readonly());
}

#[test]
#[should_panic(expected = "overlap")]
fn overlapping_record_fields_panic() {
  RecordLayout::sparse(vec![
    (0, 7, "a".into(), DataType::bits_ty(8)),
    (4, 11, "b".into(), DataType::bits_ty(8)),
  ]);
}

#[test]
fn record_type_eq_compares_layout() {
  let a = RecordLayout::packed(vec![
    ("x".into(), DataType::bits_ty(8)),
    ("y".into(), DataType::bits_ty(8)),
  ]);
  let b = RecordLayout::packed(vec![
    ("x".into(), DataType::bits_ty(8)),
    ("y".into(), DataType::bits_ty(8)),
  ]);
  // Same field names at different offsets are different types.
  let c = RecordLayout::packed(vec![
    ("y".into(), DataType::bits_ty(8)),
    ("x".into(), DataType::bits_ty(8)),
  ]);
  assert!(DataType::record(a.clone()).type_eq(&DataType::record(b)));
  assert!(!DataType::record(a).type_eq(&DataType::record(c)));
}
