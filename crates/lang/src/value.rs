//! Runtime values
//!
//! Expression evaluation runs on a 128-bit integer tower plus doubles,
//! with C-style promotion when operands mix. All byte-order decisions go
//! through [`Endian`] so no call site ever tests the host endianness
//! itself.

use std::fmt;

use serde::Serialize;

use crate::error::Error;
use crate::token::Operator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Byte order of the machine the evaluator runs on.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

/// Decode an unsigned integer of up to 16 bytes.
pub fn unsigned_from_bytes(bytes: &[u8], endian: Endian) -> u128 {
    let mut buf = [0u8; 16];
    match endian {
        Endian::Little => buf[..bytes.len()].copy_from_slice(bytes),
        Endian::Big => buf[16 - bytes.len()..].copy_from_slice(bytes),
    }
    match endian {
        Endian::Little => u128::from_le_bytes(buf),
        Endian::Big => u128::from_be_bytes(buf),
    }
}

/// Decode a signed integer of up to 16 bytes, sign-extending.
pub fn signed_from_bytes(bytes: &[u8], endian: Endian) -> i128 {
    let unsigned = unsigned_from_bytes(bytes, endian);
    let bits = bytes.len() as u32 * 8;
    if bits == 128 {
        return unsigned as i128;
    }

    let sign = 1u128 << (bits - 1);
    if unsigned & sign != 0 {
        (unsigned | (u128::MAX << bits)) as i128
    } else {
        unsigned as i128
    }
}

/// Decode a 4- or 8-byte IEEE 754 value.
pub fn float_from_bytes(bytes: &[u8], endian: Endian) -> f64 {
    match bytes.len() {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            f64::from(match endian {
                Endian::Little => f32::from_le_bytes(buf),
                Endian::Big => f32::from_be_bytes(buf),
            })
        }
        _ => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            match endian {
                Endian::Little => f64::from_le_bytes(buf),
                Endian::Big => f64::from_be_bytes(buf),
            }
        }
    }
}

/// A literal value: expression results, function arguments and returns,
/// in/out variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Literal {
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    Bool(bool),
    Character(char),
    Character16(u16),
    Str(String),
    /// Parameter packs bind the spilled arguments as one list.
    List(Vec<Literal>),
}

impl Literal {
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Unsigned(_) => "unsigned",
            Literal::Signed(_) => "signed",
            Literal::Float(_) => "float",
            Literal::Bool(_) => "bool",
            Literal::Character(_) => "char",
            Literal::Character16(_) => "char16",
            Literal::Str(_) => "string",
            Literal::List(_) => "list",
        }
    }

    pub fn to_unsigned(&self) -> u128 {
        match self {
            Literal::Unsigned(v) => *v,
            Literal::Signed(v) => *v as u128,
            Literal::Float(v) => *v as u128,
            Literal::Bool(v) => u128::from(*v),
            Literal::Character(c) => *c as u128,
            Literal::Character16(c) => u128::from(*c),
            Literal::Str(_) | Literal::List(_) => 0,
        }
    }

    pub fn to_signed(&self) -> i128 {
        match self {
            Literal::Unsigned(v) => *v as i128,
            Literal::Signed(v) => *v,
            Literal::Float(v) => *v as i128,
            Literal::Bool(v) => i128::from(*v),
            Literal::Character(c) => *c as i128,
            Literal::Character16(c) => i128::from(*c),
            Literal::Str(_) | Literal::List(_) => 0,
        }
    }

    pub fn to_float(&self) -> f64 {
        match self {
            Literal::Unsigned(v) => *v as f64,
            Literal::Signed(v) => *v as f64,
            Literal::Float(v) => *v,
            Literal::Bool(v) => f64::from(u8::from(*v)),
            Literal::Character(c) => *c as u32 as f64,
            Literal::Character16(c) => f64::from(*c),
            Literal::Str(_) | Literal::List(_) => 0.0,
        }
    }

    /// Truthiness: zero and the empty string are false.
    pub fn to_bool(&self) -> bool {
        match self {
            Literal::Unsigned(v) => *v != 0,
            Literal::Signed(v) => *v != 0,
            Literal::Float(v) => *v != 0.0,
            Literal::Bool(v) => *v,
            Literal::Character(c) => *c != '\0',
            Literal::Character16(c) => *c != 0,
            Literal::Str(s) => !s.is_empty(),
            Literal::List(l) => !l.is_empty(),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Unsigned(v) => write!(f, "{v}"),
            Literal::Signed(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Character(c) => write!(f, "{c}"),
            Literal::Character16(c) => match char::from_u32(u32::from(*c)) {
                Some(c) => write!(f, "{c}"),
                None => write!(f, "\\u{c:04x}"),
            },
            Literal::Str(s) => f.write_str(s),
            Literal::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Operand pairing after C-style promotion. Floats dominate; with mixed
/// signedness the unsigned interpretation wins (both sides already span
/// 128 bits, so there is no wider signed type left to widen into).
enum Promoted {
    Unsigned(u128, u128),
    Signed(i128, i128),
    Float(f64, f64),
}

fn promote(left: &Literal, right: &Literal) -> Promoted {
    use Literal::*;

    if matches!(left, Float(_)) || matches!(right, Float(_)) {
        return Promoted::Float(left.to_float(), right.to_float());
    }

    let left_unsigned = matches!(left, Unsigned(_) | Bool(_) | Character(_) | Character16(_));
    let right_unsigned = matches!(right, Unsigned(_) | Bool(_) | Character(_) | Character16(_));

    if left_unsigned && right_unsigned {
        Promoted::Unsigned(left.to_unsigned(), right.to_unsigned())
    } else if !left_unsigned && !right_unsigned {
        Promoted::Signed(left.to_signed(), right.to_signed())
    } else {
        Promoted::Unsigned(left.to_unsigned(), right.to_unsigned())
    }
}

fn overflow(line: u32, op: Operator) -> Error {
    Error::Evaluation {
        line,
        message: format!("integer overflow in '{op}'"),
    }
}

/// Apply a binary operator, promoting the operands first.
pub fn apply_binary(
    op: Operator,
    left: &Literal,
    right: &Literal,
    line: u32,
) -> Result<Literal, Error> {
    use Operator::*;

    // String concatenation and comparison short-circuit the tower.
    if let (Literal::Str(a), Literal::Str(b)) = (left, right) {
        return match op {
            Plus => Ok(Literal::Str(format!("{a}{b}"))),
            Equal => Ok(Literal::Bool(a == b)),
            NotEqual => Ok(Literal::Bool(a != b)),
            _ => Err(Error::Evaluation {
                line,
                message: format!("operator '{op}' is not defined for strings"),
            }),
        };
    }

    if matches!(left, Literal::List(_)) || matches!(right, Literal::List(_)) {
        return Err(Error::Evaluation {
            line,
            message: format!("operator '{op}' is not defined for parameter packs"),
        });
    }

    // Logical operators work on truthiness regardless of operand type.
    match op {
        BoolAnd => return Ok(Literal::Bool(left.to_bool() && right.to_bool())),
        BoolOr => return Ok(Literal::Bool(left.to_bool() || right.to_bool())),
        BoolXor => return Ok(Literal::Bool(left.to_bool() ^ right.to_bool())),
        _ => {}
    }

    if matches!(op, Slash | Percent) && !right.to_bool() && !matches!(right, Literal::Float(_)) {
        return Err(Error::Evaluation {
            line,
            message: "division by zero".into(),
        });
    }

    match promote(left, right) {
        Promoted::Float(a, b) => {
            let value = match op {
                Plus => a + b,
                Minus => a - b,
                Star => a * b,
                Slash => a / b,
                Percent => a % b,
                Pow => a.powf(b),
                Equal => return Ok(Literal::Bool(a == b)),
                NotEqual => return Ok(Literal::Bool(a != b)),
                Less => return Ok(Literal::Bool(a < b)),
                LessEqual => return Ok(Literal::Bool(a <= b)),
                Greater => return Ok(Literal::Bool(a > b)),
                GreaterEqual => return Ok(Literal::Bool(a >= b)),
                _ => {
                    return Err(Error::Evaluation {
                        line,
                        message: format!("operator '{op}' is not defined for floats"),
                    });
                }
            };
            Ok(Literal::Float(value))
        }
        Promoted::Unsigned(a, b) => {
            let value = match op {
                Plus => a.checked_add(b).ok_or_else(|| overflow(line, op))?,
                Minus => a.checked_sub(b).ok_or_else(|| overflow(line, op))?,
                Star => a.checked_mul(b).ok_or_else(|| overflow(line, op))?,
                Slash => a / b,
                Percent => a % b,
                Pow => a
                    .checked_pow(b.min(u128::from(u32::MAX)) as u32)
                    .ok_or_else(|| overflow(line, op))?,
                ShiftLeft => a.checked_shl(b.min(128) as u32).unwrap_or(0),
                ShiftRight => a.checked_shr(b.min(128) as u32).unwrap_or(0),
                BitAnd => a & b,
                BitOr => a | b,
                BitXor => a ^ b,
                Equal => return Ok(Literal::Bool(a == b)),
                NotEqual => return Ok(Literal::Bool(a != b)),
                Less => return Ok(Literal::Bool(a < b)),
                LessEqual => return Ok(Literal::Bool(a <= b)),
                Greater => return Ok(Literal::Bool(a > b)),
                GreaterEqual => return Ok(Literal::Bool(a >= b)),
                _ => {
                    return Err(Error::Evaluation {
                        line,
                        message: format!("'{op}' cannot be applied to integers"),
                    });
                }
            };
            Ok(Literal::Unsigned(value))
        }
        Promoted::Signed(a, b) => {
            let value = match op {
                Plus => a.checked_add(b).ok_or_else(|| overflow(line, op))?,
                Minus => a.checked_sub(b).ok_or_else(|| overflow(line, op))?,
                Star => a.checked_mul(b).ok_or_else(|| overflow(line, op))?,
                Slash => a.checked_div(b).ok_or_else(|| overflow(line, op))?,
                Percent => a.checked_rem(b).ok_or_else(|| overflow(line, op))?,
                Pow => a
                    .checked_pow(b.clamp(0, i128::from(u32::MAX)) as u32)
                    .ok_or_else(|| overflow(line, op))?,
                ShiftLeft => a.checked_shl(b.clamp(0, 128) as u32).unwrap_or(0),
                ShiftRight => a.checked_shr(b.clamp(0, 128) as u32).unwrap_or(0),
                BitAnd => a & b,
                BitOr => a | b,
                BitXor => a ^ b,
                Equal => return Ok(Literal::Bool(a == b)),
                NotEqual => return Ok(Literal::Bool(a != b)),
                Less => return Ok(Literal::Bool(a < b)),
                LessEqual => return Ok(Literal::Bool(a <= b)),
                Greater => return Ok(Literal::Bool(a > b)),
                GreaterEqual => return Ok(Literal::Bool(a >= b)),
                _ => {
                    return Err(Error::Evaluation {
                        line,
                        message: format!("'{op}' cannot be applied to integers"),
                    });
                }
            };
            Ok(Literal::Signed(value))
        }
    }
}

/// Apply a unary operator.
pub fn apply_unary(op: Operator, operand: &Literal, line: u32) -> Result<Literal, Error> {
    match op {
        Operator::Plus => Ok(operand.clone()),
        Operator::Minus => match operand {
            Literal::Float(v) => Ok(Literal::Float(-v)),
            Literal::Signed(v) => v
                .checked_neg()
                .map(Literal::Signed)
                .ok_or_else(|| overflow(line, op)),
            other => {
                let value = other.to_signed();
                value
                    .checked_neg()
                    .map(Literal::Signed)
                    .ok_or_else(|| overflow(line, op))
            }
        },
        Operator::BoolNot => Ok(Literal::Bool(!operand.to_bool())),
        Operator::BitNot => match operand {
            Literal::Signed(v) => Ok(Literal::Signed(!v)),
            other => Ok(Literal::Unsigned(!other.to_unsigned())),
        },
        _ => Err(Error::Evaluation {
            line,
            message: format!("'{op}' is not a unary operator"),
        }),
    }
}
