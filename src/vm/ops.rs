//! 复合赋值运算
//!
//! 所有运算都是就地的：结果写回左操作数并保持左操作数的标签，
//! 右操作数先转换为左操作数的数值类型。
//!
//! - 整数运算回绕，除以零报 `InvalidOperation`
//! - 浮点数不支持位运算
//! - 对象左操作数转发到 `operator+=` 等用户方法
//! - noting 左操作数直接取右操作数的值

use super::cast::{number_of, Number};
use super::meta::{VType, ValueMeta};
use super::value::{Payload, ValueItem};
use crate::config::{
    OP_ADD_ASSIGN, OP_AND_ASSIGN, OP_DEC, OP_DIV_ASSIGN, OP_INC, OP_MUL_ASSIGN, OP_NOT, OP_OR_ASSIGN,
    OP_REM_ASSIGN, OP_SHL_ASSIGN, OP_SHR_ASSIGN, OP_SUB_ASSIGN, OP_XOR_ASSIGN,
};
use crate::error::{ValueError, ValueResult};
use crate::runtime::interface::Interface;
use crate::vm::vtable::ClassAccess;

/// 二元运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Xor,
    And,
    Or,
    Shl,
    Shr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+=",
            BinOp::Sub => "-=",
            BinOp::Mul => "*=",
            BinOp::Div => "/=",
            BinOp::Rem => "%=",
            BinOp::Xor => "^=",
            BinOp::And => "&=",
            BinOp::Or => "|=",
            BinOp::Shl => "<<=",
            BinOp::Shr => ">>=",
        }
    }

    /// 对象上对应的运算符方法名
    pub fn method(self) -> &'static str {
        match self {
            BinOp::Add => OP_ADD_ASSIGN,
            BinOp::Sub => OP_SUB_ASSIGN,
            BinOp::Mul => OP_MUL_ASSIGN,
            BinOp::Div => OP_DIV_ASSIGN,
            BinOp::Rem => OP_REM_ASSIGN,
            BinOp::Xor => OP_XOR_ASSIGN,
            BinOp::And => OP_AND_ASSIGN,
            BinOp::Or => OP_OR_ASSIGN,
            BinOp::Shl => OP_SHL_ASSIGN,
            BinOp::Shr => OP_SHR_ASSIGN,
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(self, BinOp::Xor | BinOp::And | BinOp::Or | BinOp::Shl | BinOp::Shr)
    }
}

// ============================================================================
// 数值运算
// ============================================================================

trait DynNumber: Copy {
    fn from_number(n: Number) -> Self;
    fn apply(self, op: BinOp, rhs: Self) -> ValueResult<Self>;
    fn step(self, up: bool) -> Self;
}

fn division_by_zero(op: BinOp) -> ValueError {
    ValueError::InvalidOperation(format!("division by zero in {}", op.symbol()))
}

macro_rules! impl_dyn_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl DynNumber for $t {
                #[inline]
                fn from_number(n: Number) -> Self {
                    match n {
                        Number::Int(i) => i as $t,
                        Number::Float(f) => f as $t,
                    }
                }

                fn apply(self, op: BinOp, rhs: Self) -> ValueResult<Self> {
                    Ok(match op {
                        BinOp::Add => self.wrapping_add(rhs),
                        BinOp::Sub => self.wrapping_sub(rhs),
                        BinOp::Mul => self.wrapping_mul(rhs),
                        BinOp::Div if rhs == 0 => return Err(division_by_zero(op)),
                        BinOp::Div => self.wrapping_div(rhs),
                        BinOp::Rem if rhs == 0 => return Err(division_by_zero(op)),
                        BinOp::Rem => self.wrapping_rem(rhs),
                        BinOp::Xor => self ^ rhs,
                        BinOp::And => self & rhs,
                        BinOp::Or => self | rhs,
                        BinOp::Shl => self.wrapping_shl(rhs as u32),
                        BinOp::Shr => self.wrapping_shr(rhs as u32),
                    })
                }

                #[inline]
                fn step(self, up: bool) -> Self {
                    if up { self.wrapping_add(1) } else { self.wrapping_sub(1) }
                }
            }
        )*
    };
}

macro_rules! impl_dyn_float {
    ($($t:ty),* $(,)?) => {
        $(
            impl DynNumber for $t {
                #[inline]
                fn from_number(n: Number) -> Self {
                    match n {
                        Number::Int(i) => i as $t,
                        Number::Float(f) => f as $t,
                    }
                }

                fn apply(self, op: BinOp, rhs: Self) -> ValueResult<Self> {
                    Ok(match op {
                        BinOp::Add => self + rhs,
                        BinOp::Sub => self - rhs,
                        BinOp::Mul => self * rhs,
                        BinOp::Div => self / rhs,
                        BinOp::Rem => self % rhs,
                        _ => return Err(ValueError::invalid_operator(op.symbol(), stringify!($t), stringify!($t))),
                    })
                }

                #[inline]
                fn step(self, up: bool) -> Self {
                    if up { self + 1.0 } else { self - 1.0 }
                }
            }
        )*
    };
}

impl_dyn_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize);
impl_dyn_float!(f32, f64);

fn apply_to<T: DynNumber>(x: &mut T, op: BinOp, rhs: Number) -> ValueResult<()> {
    *x = x.apply(op, T::from_number(rhs))?;
    Ok(())
}

/// 数值负载上的运算，返回 None 表示左操作数不是数值
fn numeric_apply(val: &mut Payload, op: BinOp, rhs: Number) -> Option<ValueResult<()>> {
    Some(match val {
        Payload::I8(x) => apply_to(x, op, rhs),
        Payload::I16(x) => apply_to(x, op, rhs),
        Payload::I32(x) => apply_to(x, op, rhs),
        Payload::I64(x) => apply_to(x, op, rhs),
        Payload::Ui8(x) => apply_to(x, op, rhs),
        Payload::Ui16(x) => apply_to(x, op, rhs),
        Payload::Ui32(x) => apply_to(x, op, rhs),
        Payload::Ui64(x) => apply_to(x, op, rhs),
        Payload::Flo(x) => apply_to(x, op, rhs),
        Payload::Doub(x) => apply_to(x, op, rhs),
        Payload::UndefinedPtr(x) => apply_to(x, op, rhs),
        Payload::TimePoint(x) if matches!(op, BinOp::Add | BinOp::Sub) => apply_to(x, op, rhs),
        _ => return None,
    })
}

fn truthy(n: Number) -> bool {
    match n {
        Number::Int(i) => i != 0,
        Number::Float(f) => f != 0.0,
    }
}

// ============================================================================
// 运算派发
// ============================================================================

/// 右操作数的快照：独立于左操作数，避免与左操作数共享 GC 单元时重入加锁
struct Operand {
    value: ValueItem,
    number: Option<Number>,
    text: Option<String>,
}

impl Operand {
    fn capture(rhs: &ValueItem, need_text: bool) -> ValueResult<Self> {
        let mut value = rhs.try_clone()?;
        value.ungc()?;
        let number = value.view(|val, _| Ok(number_of(val)))?;
        let text = if need_text { Some(value.to_script_string()?) } else { None };
        Ok(Self { value, number, text })
    }
}

fn binary(lhs: &mut ValueItem, rhs: &ValueItem, op: BinOp) -> ValueResult<()> {
    lhs.check_editable()?;
    rhs.check_editable()?;
    lhs.get_async_result()?;

    let lhs_type = lhs.vtype();
    if lhs_type.is_object() {
        let arg = rhs.try_clone()?;
        Interface::make_call(ClassAccess::Pub, lhs, op.method(), vec![arg])?;
        return Ok(());
    }

    let need_text = lhs_type == VType::String && matches!(op, BinOp::Add | BinOp::Sub);
    let operand = Operand::capture(rhs, need_text)?;
    let rhs_type = operand.value.vtype();
    let unsupported = || ValueError::invalid_operator(op.symbol(), lhs_type, rhs_type);

    let Operand { value, number, text } = operand;
    lhs.view_mut(move |val, meta| {
        if let Payload::Empty = val {
            adopt(val, meta, value);
            return Ok(());
        }
        match val {
            Payload::Bool(b) if op.is_bitwise() && !matches!(op, BinOp::Shl | BinOp::Shr) => {
                let r = number.map(truthy).ok_or_else(unsupported)?;
                *b = match op {
                    BinOp::Xor => *b ^ r,
                    BinOp::And => *b & r,
                    _ => *b | r,
                };
                Ok(())
            }
            Payload::Array(items) if matches!(op, BinOp::Add | BinOp::Sub) => {
                items.push(value);
                Ok(())
            }
            Payload::String(s) if matches!(op, BinOp::Add | BinOp::Sub) => {
                let text = text.unwrap_or_default();
                if op == BinOp::Add {
                    s.push_str(&text);
                } else {
                    s.insert_str(0, &text);
                }
                Ok(())
            }
            other => match number {
                Some(n) => numeric_apply(other, op, n).unwrap_or_else(|| Err(unsupported())),
                None => Err(unsupported()),
            },
        }
    })
}

/// noting 左操作数取右操作数的值
fn adopt(val: &mut Payload, meta: &mut ValueMeta, value: ValueItem) {
    let (new_val, mut new_meta) = value.into_parts();
    new_meta.set_allow_edit(true);
    *val = new_val;
    *meta = new_meta;
}

/// `lhs += rhs`
pub fn dyn_sum(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Add)
}

/// `lhs -= rhs`
pub fn dyn_minus(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Sub)
}

pub fn dyn_mul(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Mul)
}

pub fn dyn_div(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Div)
}

pub fn dyn_rest(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Rem)
}

pub fn dyn_bit_xor(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Xor)
}

pub fn dyn_bit_and(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::And)
}

pub fn dyn_bit_or(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Or)
}

pub fn dyn_bit_shift_left(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Shl)
}

pub fn dyn_bit_shift_right(lhs: &mut ValueItem, rhs: &ValueItem) -> ValueResult<()> {
    binary(lhs, rhs, BinOp::Shr)
}

// ============================================================================
// 一元运算
// ============================================================================

fn step(lhs: &mut ValueItem, up: bool) -> ValueResult<()> {
    lhs.check_editable()?;
    lhs.get_async_result()?;
    if lhs.vtype().is_object() {
        Interface::make_call(ClassAccess::Pub, lhs, if up { OP_INC } else { OP_DEC }, Vec::new())?;
        return Ok(());
    }
    let symbol = if up { "++" } else { "--" };
    lhs.view_mut(|val, meta| {
        match val {
            Payload::I8(x) => *x = x.step(up),
            Payload::I16(x) => *x = x.step(up),
            Payload::I32(x) => *x = x.step(up),
            Payload::I64(x) => *x = x.step(up),
            Payload::Ui8(x) => *x = x.step(up),
            Payload::Ui16(x) => *x = x.step(up),
            Payload::Ui32(x) => *x = x.step(up),
            Payload::Ui64(x) => *x = x.step(up),
            Payload::Flo(x) => *x = x.step(up),
            Payload::Doub(x) => *x = x.step(up),
            Payload::UndefinedPtr(x) => *x = x.step(up),
            Payload::TimePoint(x) => *x = x.step(up),
            _ => return Err(ValueError::invalid_operator(symbol, meta.vtype(), "noting")),
        }
        Ok(())
    })
}

/// `++lhs`
pub fn dyn_inc(lhs: &mut ValueItem) -> ValueResult<()> {
    step(lhs, true)
}

/// `--lhs`
pub fn dyn_dec(lhs: &mut ValueItem) -> ValueResult<()> {
    step(lhs, false)
}

/// 布尔取反，整数按位取反
pub fn dyn_not(lhs: &mut ValueItem) -> ValueResult<()> {
    lhs.check_editable()?;
    lhs.get_async_result()?;
    if lhs.vtype().is_object() {
        Interface::make_call(ClassAccess::Pub, lhs, OP_NOT, Vec::new())?;
        return Ok(());
    }
    lhs.view_mut(|val, meta| {
        match val {
            Payload::Bool(x) => *x = !*x,
            Payload::I8(x) => *x = !*x,
            Payload::I16(x) => *x = !*x,
            Payload::I32(x) => *x = !*x,
            Payload::I64(x) => *x = !*x,
            Payload::Ui8(x) => *x = !*x,
            Payload::Ui16(x) => *x = !*x,
            Payload::Ui32(x) => *x = !*x,
            Payload::Ui64(x) => *x = !*x,
            Payload::UndefinedPtr(x) => *x = !*x,
            _ => return Err(ValueError::invalid_operator("!", meta.vtype(), "noting")),
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::function::FuncEnvironment;
    use crate::vm::class::{ClassField, ClassValue};
    use crate::vm::vtable::{AttachAVirtualTable, MethodInfo, VTableSlots};
    use std::sync::Arc;

    #[test]
    fn test_integer_ops_keep_lhs_type() {
        let mut a = ValueItem::from(10i32);
        dyn_sum(&mut a, &ValueItem::from(2.9f64)).unwrap();
        assert_eq!(a.vtype(), VType::I32);
        assert_eq!(a, ValueItem::from(12i32));

        dyn_mul(&mut a, &ValueItem::from(3u8)).unwrap();
        dyn_rest(&mut a, &ValueItem::from(7i64)).unwrap();
        assert_eq!(a, ValueItem::from(1i32));

        let mut small = ValueItem::from(250u8);
        dyn_sum(&mut small, &ValueItem::from(10i32)).unwrap();
        assert_eq!(small, ValueItem::from(4u8));

        let mut bits = ValueItem::from(0b1100u16);
        dyn_bit_and(&mut bits, &ValueItem::from(0b1010u16)).unwrap();
        dyn_bit_shift_left(&mut bits, &ValueItem::from(2i32)).unwrap();
        assert_eq!(bits, ValueItem::from(0b100000u16));
    }

    #[test]
    fn test_division_by_zero() {
        let mut a = ValueItem::from(1i64);
        assert!(matches!(dyn_div(&mut a, &ValueItem::from(0i64)), Err(ValueError::InvalidOperation(_))));
        assert_eq!(a, ValueItem::from(1i64));

        let mut f = ValueItem::from(1.0f64);
        dyn_div(&mut f, &ValueItem::from(0i32)).unwrap();
        assert_eq!(f.cast::<f64>().unwrap(), f64::INFINITY);
        assert!(dyn_bit_xor(&mut f, &ValueItem::from(1i32)).is_err());
    }

    #[test]
    fn test_strings_and_arrays() {
        let mut s = ValueItem::from("b");
        dyn_sum(&mut s, &ValueItem::from(1i32)).unwrap();
        dyn_minus(&mut s, &ValueItem::from("a")).unwrap();
        assert_eq!(s.to_script_string().unwrap(), "ab1");

        let mut arr = ValueItem::array(Vec::new());
        dyn_sum(&mut arr, &ValueItem::from(1i32)).unwrap();
        dyn_minus(&mut arr, &ValueItem::from("x")).unwrap();
        assert_eq!(arr.len().unwrap(), 2);
        assert!(dyn_mul(&mut arr, &ValueItem::from(2i32)).is_err());
    }

    #[test]
    fn test_noting_adopts_rhs() {
        let mut n = ValueItem::null();
        dyn_sum(&mut n, &ValueItem::from("v")).unwrap();
        assert_eq!(n.vtype(), VType::String);
        assert!(n.allow_edit());
    }

    #[test]
    fn test_readonly_operands() {
        let readonly = ValueItem::from(1i32).with_allow_edit(false);
        let mut b = ValueItem::from(5i32);
        assert_eq!(dyn_sum(&mut b, &readonly), Err(ValueError::UnmodifiableValue));
        assert_eq!(b, ValueItem::from(5i32));

        let mut locked = ValueItem::from(5i32).with_allow_edit(false);
        assert_eq!(dyn_inc(&mut locked), Err(ValueError::UnmodifiableValue));
    }

    #[test]
    fn test_unary() {
        let mut b = ValueItem::from(true);
        dyn_not(&mut b).unwrap();
        assert_eq!(b, ValueItem::from(false));
        dyn_bit_or(&mut b, &ValueItem::from(1i32)).unwrap();
        assert_eq!(b, ValueItem::from(true));

        let mut i = ValueItem::from(0u8);
        dyn_dec(&mut i).unwrap();
        assert_eq!(i, ValueItem::from(255u8));
        dyn_not(&mut i).unwrap();
        assert_eq!(i, ValueItem::from(0u8));

        let mut t = ValueItem::time_point(100);
        dyn_inc(&mut t).unwrap();
        dyn_sum(&mut t, &ValueItem::from(9i32)).unwrap();
        assert_eq!(t, ValueItem::time_point(110));
        assert!(dyn_mul(&mut t, &ValueItem::from(2i32)).is_err());

        assert!(dyn_not(&mut ValueItem::from(1.5f32)).is_err());
    }

    #[test]
    fn test_object_forwards_to_operator_method() {
        let add = FuncEnvironment::native(
            OP_ADD_ASSIGN,
            |args| {
                let total = Interface::get_value(ClassAccess::Priv, &args[0], "total")?;
                let next = ValueItem::from(total.cast::<i64>()? + args[1].cast::<i64>()?);
                Interface::set_value(ClassAccess::Priv, &args[0], "total", &next)?;
                Ok(None)
            },
            None,
        );
        let vtable = AttachAVirtualTable::new(
            "Acc",
            vec![MethodInfo::new(OP_ADD_ASSIGN, Arc::new(add), ClassAccess::Pub)],
            VTableSlots::default(),
        );
        let mut acc = ValueItem::class(ClassValue::new(
            "Acc",
            vec![ClassField::new("total", ClassAccess::Priv, ValueItem::from(1i64))],
            Arc::new(vtable),
        ));
        dyn_sum(&mut acc, &ValueItem::from(4i32)).unwrap();
        assert_eq!(Interface::get_value(ClassAccess::Priv, &acc, "total").unwrap(), ValueItem::from(5i64));
        assert!(matches!(dyn_minus(&mut acc, &ValueItem::from(1i32)), Err(ValueError::NotImplemented(_))));
    }

    #[test]
    fn test_gc_self_assignment() {
        let mut shared = ValueItem::gc(ValueItem::from(3i32)).unwrap();
        let alias = shared.reference().unwrap();
        dyn_sum(&mut shared, &alias).unwrap();
        assert_eq!(shared, ValueItem::from(6i32));
    }
}
