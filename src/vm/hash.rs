//! 值哈希
//!
//! 与比较保持一致：跨类型相等的数值哈希相同（整数值的浮点数按整数哈希），
//! 各种数组按元素顺序混合，映射和集合与顺序无关。
//! 异常值和异步结果不可哈希，哈希从不解析异步结果。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::cast::{number_of, Number};
use super::meta::VType;
use super::structure::Structure;
use super::value::{object_ref, Payload, ValueItem};
use crate::config::METHOD_HASH;
use crate::error::{ValueError, ValueResult};
use crate::runtime::interface::Interface;
use crate::vm::vtable::ClassAccess;

/// 序列混合
#[inline]
fn mix(seed: u64, h: u64) -> u64 {
    seed ^ h.wrapping_add(0x9e37_79b9).wrapping_add(seed << 6).wrapping_add(seed >> 2)
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn hash_number(n: Number) -> u64 {
    match n {
        Number::Int(i) => hash_of(&i),
        Number::Float(f) if f.fract() == 0.0 && f >= i128::MIN as f64 && f <= i128::MAX as f64 => {
            hash_of(&(f as i128))
        }
        Number::Float(f) if f.is_nan() => hash_of(&u64::MAX),
        Number::Float(f) => hash_of(&f.to_bits()),
    }
}

fn hash_sequence<'a>(items: impl Iterator<Item = &'a ValueItem>) -> ValueResult<u64> {
    let mut seed = 0u64;
    for item in items {
        seed = mix(seed, hash_value(item)?);
    }
    Ok(seed)
}

/// 计算值的哈希
pub fn hash_value(item: &ValueItem) -> ValueResult<u64> {
    let obj = match item.payload() {
        Payload::Async(_) => {
            return Err(ValueError::InvalidType("async result is not hashable".to_string()))
        }
        Payload::Gc(cell) => return cell.read(hash_value),
        Payload::GcRef(weak) => {
            return match weak.upgrade() {
                Some(cell) => cell.read(hash_value),
                None => Ok(0),
            }
        }
        val => object_ref(val),
    };
    if let Some(obj) = obj {
        return hash_object(&obj);
    }

    let val = item.payload();
    if let Some(n) = number_of(val) {
        return Ok(hash_number(n));
    }
    match val {
        Payload::Empty => Ok(0),
        Payload::TypeIdentifier(t) => Ok(hash_of(&("type", *t as u8))),
        Payload::String(s) => Ok(hash_of(s.as_str())),
        Payload::RawArray(arr) => {
            let mut seed = 0u64;
            for i in 0..arr.len() {
                if let Some(e) = arr.get(i) {
                    seed = mix(seed, hash_value(&e)?);
                }
            }
            Ok(seed)
        }
        Payload::Array(items) | Payload::StackArray(items) => hash_sequence(items.iter()),
        Payload::FixedArray(items) => hash_sequence(items.iter()),
        Payload::Map(map) => {
            let mut total = 0u64;
            for (k, v) in map {
                total = total.wrapping_add(mix(hash_value(k)?, hash_value(v)?));
            }
            Ok(total)
        }
        Payload::Set(set) => {
            let mut total = 0u64;
            for v in set {
                total = total.wrapping_add(hash_value(v)?);
            }
            Ok(total)
        }
        Payload::Function(_) => Ok(hash_of(VType::Function.name())),
        Payload::Exception(_) => {
            Err(ValueError::InvalidType("exception value is not hashable".to_string()))
        }
        _ => Err(ValueError::InvalidType(format!("{} is not hashable", item.vtype()))),
    }
}

/// 用户对象：优先调用 hash 方法
///
/// 没有 hash 方法时必须与 `compare_value` 一致：
/// 无虚表结构体按数据块和对象字段哈希，其余对象只按类型哈希
fn hash_object(obj: &ValueItem) -> ValueResult<u64> {
    if obj.vtype() == VType::Struct && Interface::has_implement(ClassAccess::Pub, obj, METHOD_HASH) {
        if let Some(result) = Interface::make_call(ClassAccess::Pub, obj, METHOD_HASH, Vec::new())? {
            return result.cast::<u64>();
        }
    }
    if let Payload::Struct(h) = obj.payload() {
        if let Some((data, objects)) = Structure::raw_contents(h)? {
            return Ok(mix(hash_of(&data[..]), hash_sequence(objects.iter())?));
        }
    }
    Ok(hash_of(obj.vtype().name()))
}

impl Hash for ValueItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match hash_value(self) {
            Ok(h) => state.write_u64(h),
            Err(err) => {
                tracing::warn!(error = %err, "hashing unhashable value");
                state.write_u64(0);
            }
        }
    }
}
