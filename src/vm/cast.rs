//! 类型转换
//!
//! - `FromValue`：动态值到宿主类型的数值转换（`as` 语义，字符串先解析）
//! - `get_size`：转为下标/长度，负数、非整数浮点、NaN 报数值下溢
//! - `as_value`：就地改变值的标签
//! - `to_script_string`：值的文本形式（与 `parse_value` 互逆）

use super::meta::{VType, ValueMeta};
use super::parse::parse_value;
use super::value::{object_ref, Payload, RawArray, ValueItem};
use crate::config::METHOD_TO_STRING;
use crate::error::{ValueError, ValueResult};
use crate::runtime::interface::Interface;
use crate::vm::vtable::ClassAccess;

// ============================================================================
// 数值视图
// ============================================================================

/// 统一的数值表示
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Int(i128),
    Float(f64),
}

/// 提取数值（布尔、时间点、未定义指针都按整数处理）
pub(crate) fn number_of(val: &Payload) -> Option<Number> {
    Some(match val {
        Payload::Bool(v) => Number::Int(*v as i128),
        Payload::I8(v) => Number::Int(*v as i128),
        Payload::I16(v) => Number::Int(*v as i128),
        Payload::I32(v) => Number::Int(*v as i128),
        Payload::I64(v) => Number::Int(*v as i128),
        Payload::Ui8(v) => Number::Int(*v as i128),
        Payload::Ui16(v) => Number::Int(*v as i128),
        Payload::Ui32(v) => Number::Int(*v as i128),
        Payload::Ui64(v) => Number::Int(*v as i128),
        Payload::UndefinedPtr(v) => Number::Int(*v as i128),
        Payload::TimePoint(v) => Number::Int(*v as i128),
        Payload::Flo(v) => Number::Float(*v as f64),
        Payload::Doub(v) => Number::Float(*v),
        _ => return None,
    })
}

/// 取值的数值形式，字符串先解析
fn number_for(value: &ValueItem, target: &str) -> ValueResult<Number> {
    value.view(|val, meta| {
        if let Some(n) = number_of(val) {
            return Ok(n);
        }
        match val {
            Payload::String(s) => {
                let parsed = parse_value(s);
                number_of(parsed.payload()).ok_or_else(|| ValueError::invalid_cast(format!("\"{}\"", s), target))
            }
            _ => Err(ValueError::invalid_cast(meta.vtype(), target)),
        }
    })
}

// ============================================================================
// FromValue
// ============================================================================

/// 从动态值转换
pub trait FromValue: Sized {
    fn from_value(value: &ValueItem) -> ValueResult<Self>;
}

macro_rules! impl_from_value_num {
    ($($t:ty),* $(,)?) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &ValueItem) -> ValueResult<Self> {
                    Ok(match number_for(value, stringify!($t))? {
                        Number::Int(i) => i as $t,
                        Number::Float(f) => f as $t,
                    })
                }
            }
        )*
    };
}

impl_from_value_num!(i8, i16, i32, i64, u8, u16, u32, u64, usize, f32, f64);

impl FromValue for bool {
    fn from_value(value: &ValueItem) -> ValueResult<Self> {
        Ok(match number_for(value, "boolean")? {
            Number::Int(i) => i != 0,
            Number::Float(f) => f != 0.0,
        })
    }
}

impl FromValue for String {
    fn from_value(value: &ValueItem) -> ValueResult<Self> {
        value.to_script_string()
    }
}

impl ValueItem {
    /// 转换为宿主类型
    pub fn cast<T: FromValue>(&self) -> ValueResult<T> {
        T::from_value(self)
    }

    /// 转换为长度/下标
    ///
    /// 负数、带小数的浮点数和 NaN 都会报 `NumericUnderflow`
    pub fn get_size(&self) -> ValueResult<usize> {
        match number_for(self, "size")? {
            Number::Int(i) => usize::try_from(i)
                .map_err(|_| ValueError::NumericUnderflow(format!("{} is not a valid size", i))),
            Number::Float(f) => {
                if f.is_nan() || f < 0.0 || f.fract() != 0.0 || f > usize::MAX as f64 {
                    Err(ValueError::NumericUnderflow(format!("{} is not a valid size", f)))
                } else {
                    Ok(f as usize)
                }
            }
        }
    }

    /// 转换为指定标签的新值
    pub fn convert_to(&self, vtype: VType) -> ValueResult<ValueItem> {
        let current = self.vtype();
        if current == vtype {
            return self.try_clone();
        }
        Ok(match vtype {
            VType::Noting => ValueItem::null(),
            VType::Boolean => ValueItem::from(self.cast::<bool>()?),
            VType::I8 => ValueItem::from(self.cast::<i8>()?),
            VType::I16 => ValueItem::from(self.cast::<i16>()?),
            VType::I32 => ValueItem::from(self.cast::<i32>()?),
            VType::I64 => ValueItem::from(self.cast::<i64>()?),
            VType::Ui8 => ValueItem::from(self.cast::<u8>()?),
            VType::Ui16 => ValueItem::from(self.cast::<u16>()?),
            VType::Ui32 => ValueItem::from(self.cast::<u32>()?),
            VType::Ui64 => ValueItem::from(self.cast::<u64>()?),
            VType::Flo => ValueItem::from(self.cast::<f32>()?),
            VType::Doub => ValueItem::from(self.cast::<f64>()?),
            VType::UndefinedPtr => ValueItem::undefined_ptr(self.cast::<usize>()?),
            VType::TimePoint => ValueItem::time_point(self.cast::<i64>()?),
            VType::String => ValueItem::from(self.to_script_string()?),
            VType::Uarr => ValueItem::array(self.to_items()?),
            VType::Faarr => ValueItem::fixed_array(self.to_items()?),
            t if t.is_raw_array() => {
                let items = self.to_items()?;
                let element = t.raw_array_element().unwrap_or(VType::Ui8);
                let mut raw = RawArray::zeroed(element, items.len())?;
                for (i, item) in items.iter().enumerate() {
                    raw.set(i, item)?;
                }
                ValueItem::raw_array(raw)
            }
            _ => return Err(ValueError::invalid_cast(current, vtype)),
        })
    }

    /// 就地改变标签
    pub fn as_value(&mut self, vtype: VType) -> ValueResult<()> {
        self.check_editable()?;
        if self.vtype() == vtype {
            return Ok(());
        }
        let converted = self.convert_to(vtype)?;
        self.view_mut(move |val, meta| {
            if !meta.allow_edit() {
                return Err(ValueError::UnmodifiableValue);
            }
            let (new_val, mut new_meta) = converted.into_parts();
            new_meta.set_allow_edit(true);
            // 旧负载包回 ValueItem 以走统一的释放路径
            let old = ValueItem {
                val: std::mem::replace(val, new_val),
                meta: std::mem::replace(meta, new_meta),
            };
            drop(old);
            Ok(())
        })
    }

    /// 值的文本形式
    pub fn to_script_string(&self) -> ValueResult<String> {
        scast(self, false)
    }
}

// ============================================================================
// 文本形式
// ============================================================================

enum Rendered {
    Text(String),
    Object(ValueItem),
}

fn scast(item: &ValueItem, nested: bool) -> ValueResult<String> {
    let rendered = item.view(|val, meta| {
        if let Some(obj) = object_ref(val) {
            return Ok(Rendered::Object(obj));
        }
        render(val, meta, nested).map(Rendered::Text)
    })?;
    match rendered {
        Rendered::Text(text) => Ok(text),
        Rendered::Object(obj) => render_object(&obj),
    }
}

fn render(val: &Payload, meta: ValueMeta, nested: bool) -> ValueResult<String> {
    Ok(match val {
        Payload::Empty => "null".to_string(),
        Payload::Bool(v) => v.to_string(),
        Payload::I8(v) => v.to_string(),
        Payload::I16(v) => v.to_string(),
        Payload::I32(v) => v.to_string(),
        Payload::I64(v) => v.to_string(),
        Payload::Ui8(v) => v.to_string(),
        Payload::Ui16(v) => v.to_string(),
        Payload::Ui32(v) => v.to_string(),
        Payload::Ui64(v) => v.to_string(),
        Payload::Flo(v) => format_float(*v as f64, v.to_string()),
        Payload::Doub(v) => format_float(*v, v.to_string()),
        Payload::UndefinedPtr(v) => format!("0x{:x}", v),
        Payload::TimePoint(v) => format!("t({})", v),
        Payload::TypeIdentifier(v) => v.name().to_string(),
        Payload::RawArray(arr) => {
            let parts: ValueResult<Vec<String>> = arr.items().iter().map(|e| scast(e, true)).collect();
            format!("*[{}]", parts?.join(","))
        }
        Payload::Array(items) => format!("[{}]", join(items)?),
        Payload::StackArray(items) => format!("*[{}]", join(items)?),
        Payload::FixedArray(items) => format!("*[{}]", join(items)?),
        Payload::String(s) => {
            if nested {
                quote(s)
            } else {
                s.clone()
            }
        }
        Payload::Map(map) => {
            let mut parts = Vec::with_capacity(map.len());
            for (k, v) in map {
                parts.push(format!("{}:{}", scast(k, true)?, scast(v, true)?));
            }
            format!("{{{}}}", parts.join(","))
        }
        Payload::Set(set) => {
            let parts: ValueResult<Vec<String>> = set.iter().map(|e| scast(e, true)).collect();
            format!("({})", parts?.join(","))
        }
        Payload::Function(func) => format!("func({})", func.name()),
        Payload::Exception(err) => err.to_string(),
        _ => return Err(ValueError::invalid_cast(meta.vtype(), VType::String)),
    })
}

fn join(items: &[ValueItem]) -> ValueResult<String> {
    let parts: ValueResult<Vec<String>> = items.iter().map(|e| scast(e, true)).collect();
    Ok(parts?.join(","))
}

/// 整数值的浮点数补上 `.0`，和整数区分开
fn format_float(value: f64, text: String) -> String {
    if value.is_finite() && value.fract() == 0.0 && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

/// 容器中的字符串加引号；内容含双引号时改用单引号
fn quote(s: &str) -> String {
    if s.contains('"') {
        format!("'{}'", s)
    } else {
        format!("\"{}\"", s)
    }
}

/// 对象：优先调用用户的 to_string 方法
fn render_object(obj: &ValueItem) -> ValueResult<String> {
    if Interface::has_implement(ClassAccess::Pub, obj, METHOD_TO_STRING) {
        return match Interface::make_call(ClassAccess::Pub, obj, METHOD_TO_STRING, Vec::new())? {
            Some(result) => result.to_script_string(),
            None => Ok("null".to_string()),
        };
    }
    Ok(format!("{}({})", obj.vtype().name(), Interface::name(obj)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_casts() {
        let v = ValueItem::from(-5i32);
        assert_eq!(v.cast::<f64>().unwrap(), -5.0);
        assert_eq!(v.cast::<i64>().unwrap(), -5);
        assert_eq!(ValueItem::from(300i32).cast::<u8>().unwrap(), 44);
        assert!(ValueItem::from(2u8).cast::<bool>().unwrap());
        assert_eq!(ValueItem::from("42").cast::<i32>().unwrap(), 42);
        assert!(matches!(ValueItem::null().cast::<i32>(), Err(ValueError::InvalidCast(_))));
        assert!(matches!(ValueItem::from("abc").cast::<i32>(), Err(ValueError::InvalidCast(_))));
    }

    #[test]
    fn test_get_size() {
        assert_eq!(ValueItem::from(7u16).get_size().unwrap(), 7);
        assert_eq!(ValueItem::from(4.0f64).get_size().unwrap(), 4);
        assert!(matches!(ValueItem::from(5.7f64).get_size(), Err(ValueError::NumericUnderflow(_))));
        assert!(matches!(ValueItem::from(-1i8).get_size(), Err(ValueError::NumericUnderflow(_))));
        assert!(matches!(ValueItem::from(f64::NAN).get_size(), Err(ValueError::NumericUnderflow(_))));
    }

    #[test]
    fn test_as_value_in_place() {
        let mut v = ValueItem::from(-5i32);
        v.as_value(VType::Doub).unwrap();
        assert_eq!(v.vtype(), VType::Doub);
        assert_eq!(v.to_script_string().unwrap(), "-5.0");

        let mut s = ValueItem::from("12");
        s.as_value(VType::Ui32).unwrap();
        assert_eq!(s.cast::<u32>().unwrap(), 12);

        let mut arr = ValueItem::array(vec![ValueItem::from(1i32), ValueItem::from(2i32)]);
        arr.as_value(VType::RawArrI16).unwrap();
        assert_eq!(arr.vtype(), VType::RawArrI16);

        let mut locked = ValueItem::from(1i32).with_allow_edit(false);
        assert_eq!(locked.as_value(VType::I64), Err(ValueError::UnmodifiableValue));
    }

    #[test]
    fn test_script_string_forms() {
        assert_eq!(ValueItem::null().to_script_string().unwrap(), "null");
        assert_eq!(ValueItem::from(true).to_script_string().unwrap(), "true");
        assert_eq!(ValueItem::from(1.5f32).to_script_string().unwrap(), "1.5");
        assert_eq!(ValueItem::undefined_ptr(255).to_script_string().unwrap(), "0xff");
        assert_eq!(ValueItem::time_point(10).to_script_string().unwrap(), "t(10)");

        let arr = ValueItem::array(vec![ValueItem::from(1i32), ValueItem::from("a")]);
        assert_eq!(arr.to_script_string().unwrap(), "[1,\"a\"]");

        let fixed = ValueItem::fixed_array(vec![ValueItem::from("say \"hi\"")]);
        assert_eq!(fixed.to_script_string().unwrap(), "*['say \"hi\"']");

        let raw = ValueItem::from(&[1u8, 2][..]);
        assert_eq!(raw.to_script_string().unwrap(), "*[1,2]");
    }
}
