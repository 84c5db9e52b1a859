//! 比较引擎
//!
//! `compare_value` 返回 `(相等, 小于)`。无法比较的组合返回 `(false, false)`，
//! 比较从不因类型不匹配而报错。
//!
//! 规则依次为：
//! 1. 数值对数值（布尔、时间点、未定义指针按整数处理）；一侧是数值另一侧不是时不可比较
//! 2. 字符串按字典序
//! 3. 数组对数组：短的小于长的，长度相同时逐元素比较，遇到第一个不等的元素即返回
//! 4. 数组对用户对象：对象通过 `size` 加 `operator[]get` 或 `begin`/`next` 提供元素
//! 5. 结构体对结构体：`Structure::compare`
//! 6. 映射、集合按内容判等
//! 7. 其余组合：标签相同即相等

use std::cmp::Ordering;

use super::cast::{number_of, Number};
use super::gc::calc_safe_depth_arr;
use super::meta::VType;
use super::structure::Structure;
use super::value::{object_ref, Payload, StructHandle, ValueItem};
use crate::config::{METHOD_BEGIN, METHOD_INDEX_GET, METHOD_NEXT, METHOD_SIZE};
use crate::error::{ValueError, ValueResult};
use crate::runtime::interface::Interface;
use crate::vm::vtable::ClassAccess;

const INCOMPARABLE: (bool, bool) = (false, false);

/// 比较需要在释放锁之后才能完成的部分
enum Plan {
    Done((bool, bool)),
    Structs(StructHandle, StructHandle),
    ArrayVsObject { items: Vec<ValueItem>, obj: ValueItem, obj_left: bool },
}

/// 比较两个值
pub fn compare_value(a: &ValueItem, b: &ValueItem) -> (bool, bool) {
    if !depth_safe(a) || !depth_safe(b) {
        return INCOMPARABLE;
    }
    let plan = a.view(|pa, ma| {
        b.view(|pb, mb| Ok(plan_compare(pa, ma.vtype(), pb, mb.vtype())))
    });
    match plan {
        Ok(Plan::Done(result)) => result,
        Ok(Plan::Structs(x, y)) => Structure::compare(&x, &y).unwrap_or(INCOMPARABLE),
        Ok(Plan::ArrayVsObject { items, obj, obj_left }) => match object_items(&obj) {
            Ok(obj_items) if obj_left => compare_arrays(&obj_items, &items),
            Ok(obj_items) => compare_arrays(&items, &obj_items),
            Err(err) => {
                tracing::debug!(error = %err, "object is not comparable with an array");
                INCOMPARABLE
            }
        },
        Err(_) => INCOMPARABLE,
    }
}

fn depth_safe(item: &ValueItem) -> bool {
    let vtype = item.vtype();
    if vtype.is_array() || matches!(vtype, VType::Map | VType::Set) {
        calc_safe_depth_arr(item)
    } else {
        true
    }
}

fn plan_compare(pa: &Payload, ta: VType, pb: &Payload, tb: VType) -> Plan {
    match (number_of(pa), number_of(pb)) {
        (Some(x), Some(y)) => return Plan::Done(compare_numbers(x, y)),
        (Some(_), None) | (None, Some(_)) => return Plan::Done(INCOMPARABLE),
        (None, None) => {}
    }

    match (pa, pb) {
        (Payload::String(x), Payload::String(y)) => Plan::Done((x == y, x < y)),
        (Payload::Struct(x), Payload::Struct(y)) => Plan::Structs(x.clone(), y.clone()),
        (Payload::Map(x), Payload::Map(y)) => {
            let eq = x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).map(|w| compare_value(v, w).0).unwrap_or(false));
            Plan::Done((eq, false))
        }
        (Payload::Set(x), Payload::Set(y)) => {
            let eq = x.len() == y.len() && x.iter().all(|v| y.contains(v));
            Plan::Done((eq, false))
        }
        _ if ta.is_array() && tb.is_array() => match (array_items(pa), array_items(pb)) {
            (Some(x), Some(y)) => Plan::Done(compare_arrays(&x, &y)),
            _ => Plan::Done(INCOMPARABLE),
        },
        _ if ta.is_array() => match (array_items(pa), object_ref(pb)) {
            (Some(items), Some(obj)) => Plan::ArrayVsObject { items, obj, obj_left: false },
            _ => Plan::Done(INCOMPARABLE),
        },
        _ if tb.is_array() => match (object_ref(pa), array_items(pb)) {
            (Some(obj), Some(items)) => Plan::ArrayVsObject { items, obj, obj_left: true },
            _ => Plan::Done(INCOMPARABLE),
        },
        (Payload::TypeIdentifier(x), Payload::TypeIdentifier(y)) => Plan::Done((x == y, false)),
        _ => Plan::Done((ta == tb, false)),
    }
}

fn compare_numbers(x: Number, y: Number) -> (bool, bool) {
    match (x, y) {
        (Number::Int(a), Number::Int(b)) => (a == b, a < b),
        (Number::Int(a), Number::Float(b)) => int_float(a, b),
        (Number::Float(a), Number::Int(b)) => match int_float(b, a) {
            (true, _) => (true, false),
            (false, b_less) => (false, !b_less && !a.is_nan()),
        },
        (Number::Float(a), Number::Float(b)) => float_pair(a, b),
    }
}

/// 整数与浮点数的精确比较（不经过 `as f64` 舍入）
fn int_float(a: i128, b: f64) -> (bool, bool) {
    if b.is_nan() {
        return INCOMPARABLE;
    }
    // i128 的范围是 [-2^127, 2^127)，两个边界都能用 f64 精确表示
    const LIMIT: f64 = 170_141_183_460_469_231_731_687_303_715_884_105_728.0;
    if b >= LIMIT {
        return (false, true);
    }
    if b < -LIMIT {
        return (false, false);
    }
    let floor = b.floor();
    let whole = floor as i128;
    if floor == b {
        (a == whole, a < whole)
    } else {
        // b 在 whole 和 whole + 1 之间
        (false, a <= whole)
    }
}

#[inline]
fn float_pair(a: f64, b: f64) -> (bool, bool) {
    (a == b, a < b)
}

/// 数组元素的别名拷贝（原始数组逐元素装箱）
fn array_items(val: &Payload) -> Option<Vec<ValueItem>> {
    let items = match val {
        Payload::RawArray(arr) => return Some(arr.items()),
        Payload::Array(items) | Payload::StackArray(items) => items.as_slice(),
        Payload::FixedArray(items) => &items[..],
        _ => return None,
    };
    items
        .iter()
        .map(|e| match object_ref(e.payload()) {
            Some(alias) => Some(alias),
            None => e.try_clone().ok(),
        })
        .collect()
}

/// 按长度和元素比较两个序列
///
/// 左侧更短为小于；左侧更长不可比较；长度相同时在第一个不等的元素处返回
pub fn compare_arrays(lhs: &[ValueItem], rhs: &[ValueItem]) -> (bool, bool) {
    match lhs.len().cmp(&rhs.len()) {
        Ordering::Less => return (false, true),
        Ordering::Greater => return INCOMPARABLE,
        Ordering::Equal => {}
    }
    for (x, y) in lhs.iter().zip(rhs) {
        let (eq, less) = compare_value(x, y);
        if !eq {
            return (false, less);
        }
    }
    (true, false)
}

/// 通过迭代接口取出对象的元素
fn object_items(obj: &ValueItem) -> ValueResult<Vec<ValueItem>> {
    let size = call(obj, METHOD_SIZE, Vec::new())?.get_size()?;
    let mut items = Vec::with_capacity(size);
    if Interface::has_implement(ClassAccess::Pub, obj, METHOD_INDEX_GET) {
        for i in 0..size {
            items.push(call(obj, METHOD_INDEX_GET, vec![ValueItem::from(i)])?);
        }
    } else if Interface::has_implement(ClassAccess::Pub, obj, METHOD_BEGIN)
        && Interface::has_implement(ClassAccess::Pub, obj, METHOD_NEXT)
    {
        call(obj, METHOD_BEGIN, Vec::new())?;
        for _ in 0..size {
            items.push(call(obj, METHOD_NEXT, Vec::new())?);
        }
    } else {
        return Err(ValueError::NotImplemented(format!(
            "{} does not expose an index or iterator interface",
            obj.vtype()
        )));
    }
    Ok(items)
}

fn call(obj: &ValueItem, name: &str, args: Vec<ValueItem>) -> ValueResult<ValueItem> {
    Ok(Interface::make_call(ClassAccess::Pub, obj, name, args)?.unwrap_or_default())
}

impl PartialEq for ValueItem {
    fn eq(&self, other: &Self) -> bool {
        compare_value(self, other).0
    }
}

impl Eq for ValueItem {}

impl PartialOrd for ValueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let (eq, less) = compare_value(self, other);
        if eq {
            Some(Ordering::Equal)
        } else if less {
            Some(Ordering::Less)
        } else if compare_value(other, self).1 {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}
