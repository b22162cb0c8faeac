use super::Opcode;

macro_rules! register_subcode {
  ($namespace:ident { $($opcode:ident ( $mn:ident $op:literal )),* $(,)? } ) => {
    #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
    pub enum $namespace {
      $( $opcode ),*
    }

    impl ToString for $namespace {
      fn to_string(&self) -> String {
        match self {
          $( $namespace::$opcode => $op.into() ),*
        }
      }
    }

    impl $namespace {
      pub fn mnemonic(&self) -> &'static str {
        match self {
          $( $namespace::$opcode => stringify!($mn) ),*
        }
      }
    }
  };
}

register_subcode!(
  Binary {
    Add(add "+"),
    Sub(sub "-"),
    Mul(mul "*"),
    Mod(modulo "%"),
    Shl(shl "<<"),
    Shr(shr ">>"),
    BitwiseOr(bitwise_or "|"),
    BitwiseAnd(bitwise_and "&"),
    BitwiseXor(bitwise_xor "^"),
  }
);

impl From<Binary> for Opcode {
  fn from(s: Binary) -> Self {
    Opcode::Binary { binop: s }
  }
}

register_subcode!(
  Unary {
    Flip(flip "!"),
    Neg(neg "-"),
  }
);

impl From<Unary> for Opcode {
  fn from(s: Unary) -> Self {
    Opcode::Unary { uop: s }
  }
}

register_subcode!(
  Compare {
    IGT(igt ">"),
    ILT(ilt "<"),
    IGE(ige ">="),
    ILE(ile "<="),
    EQ(eq "=="),
    NEQ(neq "!="),
  }
);

impl From<Compare> for Opcode {
  fn from(s: Compare) -> Self {
    Opcode::Compare { cmp: s }
  }
}

register_subcode!(
  FIFOField {
    Valid(valid "valid"),
    Peek(peek "peek"),
  }
);

impl From<FIFOField> for Opcode {
  fn from(s: FIFOField) -> Self {
    Opcode::FIFOField { field: s }
  }
}

register_subcode!(
  Cast {
    Bitcast(bitcast "bitcast"),
    ZExt(zext "zext"),
    SExt(sext "sext"),
  }
);

impl From<Cast> for Opcode {
  fn from(s: Cast) -> Self {
    Opcode::Cast { cast: s }
  }
}

register_subcode!(
  Intrinsic {
    WaitUntil(wait_until "wait_until"),
    Finish(finish "finish"),
    Assert(assertion "assert"),
    Barrier(barrier "barrier"),
    SendReadRequest(send_read_request "send_read_request"),
    SendWriteRequest(send_write_request "send_write_request"),
    HasMemResp(has_mem_resp "has_mem_resp"),
    MemResp(mem_resp "mem_resp"),
  }
);

impl From<Intrinsic> for Opcode {
  fn from(s: Intrinsic) -> Self {
    Opcode::Intrinsic { intrin: s }
  }
}

impl Intrinsic {
  /// Whether this intrinsic produces a value.
  pub fn is_valued(&self) -> bool {
    matches!(
      self,
      Intrinsic::SendReadRequest
        | Intrinsic::SendWriteRequest
        | Intrinsic::HasMemResp
        | Intrinsic::MemResp
    )
  }
}
