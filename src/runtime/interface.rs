//! 对象接口
//!
//! 宿主代码通过 `Interface` 按方法名和访问级别调用脚本对象，
//! 不需要关心对象是结构体、类、可变形对象还是代理。
//!
//! 方法在对象锁内查找，锁释放后再调用，第一个参数是对象自身的引用
//! （代理对象传入宿主值）。

use super::function::FuncEnvironment;
use crate::error::{ValueError, ValueResult};
use crate::vm::structure::Structure;
use crate::vm::value::{object_ref, ClassHandle, MorphHandle, Payload, ProxyHandle, StructHandle, ValueItem};
use crate::vm::vtable::ClassAccess;

use std::sync::Arc;

/// 对象句柄（已穿透 GC 与引用层）
enum Target {
    Struct(StructHandle),
    Class(ClassHandle, ValueItem),
    Morph(MorphHandle, ValueItem),
    Proxy(ProxyHandle),
}

fn target(obj: &ValueItem) -> ValueResult<Target> {
    obj.view(|val, meta| {
        let self_ref = || object_ref(val).unwrap_or_default();
        Ok(match val {
            Payload::Struct(h) => Target::Struct(Arc::clone(h)),
            Payload::Class(h) => Target::Class(Arc::clone(h), self_ref()),
            Payload::Morph(h) => Target::Morph(Arc::clone(h), self_ref()),
            Payload::Proxy(h) => Target::Proxy(Arc::clone(h)),
            _ => return Err(ValueError::InvalidType(format!("{} is not an object", meta.vtype()))),
        })
    })
}

fn no_method(type_name: &str, name: &str) -> ValueError {
    ValueError::NotImplemented(format!("{} has no accessible method {}", type_name, name))
}

fn call_with_self(
    method: Arc<FuncEnvironment>,
    this: ValueItem,
    args: Vec<ValueItem>,
) -> ValueResult<Option<ValueItem>> {
    let mut call_args = Vec::with_capacity(args.len() + 1);
    call_args.push(this);
    call_args.extend(args);
    method.sync_call(call_args)
}

pub struct Interface;

impl Interface {
    /// 按名字调用对象方法
    pub fn make_call(
        access: ClassAccess,
        obj: &ValueItem,
        name: &str,
        args: Vec<ValueItem>,
    ) -> ValueResult<Option<ValueItem>> {
        match target(obj)? {
            Target::Struct(h) => Structure::invoke(&h, name, access, args),
            Target::Class(h, this) => {
                let (method, type_name) = {
                    let class = h.lock();
                    (class.get_method(name, access), class.name().to_string())
                };
                let method = method.ok_or_else(|| no_method(&type_name, name))?;
                call_with_self(method, this, args)
            }
            Target::Morph(h, this) => {
                let (method, type_name) = {
                    let morph = h.lock();
                    (morph.get_method(name, access), morph.name().to_string())
                };
                let method = method.ok_or_else(|| no_method(&type_name, name))?;
                call_with_self(method, this, args)
            }
            Target::Proxy(h) => {
                let (method, host, type_name) = {
                    let proxy = h.lock();
                    (proxy.get_method(name, access), proxy.host_as_self()?, proxy.name().to_string())
                };
                let method = method.ok_or_else(|| no_method(&type_name, name))?;
                call_with_self(method, host, args)
            }
        }
    }

    /// 对象是否有可访问的同名方法；非对象值返回 false
    pub fn has_implement(access: ClassAccess, obj: &ValueItem, name: &str) -> bool {
        match target(obj) {
            Ok(Target::Struct(h)) => h.lock().get_method(name, access).is_some(),
            Ok(Target::Class(h, _)) => h.lock().get_method(name, access).is_some(),
            Ok(Target::Morph(h, _)) => h.lock().get_method(name, access).is_some(),
            Ok(Target::Proxy(h)) => h.lock().get_method(name, access).is_some(),
            Err(_) => false,
        }
    }

    /// 读取字段；代理对象转发给宿主值
    pub fn get_value(access: ClassAccess, obj: &ValueItem, name: &str) -> ValueResult<ValueItem> {
        match target(obj)? {
            Target::Struct(h) => h.lock().get_field_by_name(name),
            Target::Class(h, _) => h.lock().get_value(name, access),
            Target::Morph(h, _) => h.lock().get_value(name, access),
            Target::Proxy(h) => {
                let host = h.lock().host_as_self()?;
                Interface::get_value(access, &host, name)
            }
        }
    }

    /// 写入字段；代理对象转发给宿主值
    pub fn set_value(access: ClassAccess, obj: &ValueItem, name: &str, value: &ValueItem) -> ValueResult<()> {
        match target(obj)? {
            Target::Struct(h) => Structure::store_field(&h, name, value),
            Target::Class(h, _) => h.lock().set_value(name, access, value),
            Target::Morph(h, _) => h.lock().set_value(name, access, value),
            Target::Proxy(h) => {
                let host = h.lock().host_as_self()?;
                Interface::set_value(access, &host, name, value)
            }
        }
    }

    /// 对象的类型名
    pub fn name(obj: &ValueItem) -> ValueResult<String> {
        Ok(match target(obj)? {
            Target::Struct(h) => h.lock().name(),
            Target::Class(h, _) => h.lock().name().to_string(),
            Target::Morph(h, _) => h.lock().name().to_string(),
            Target::Proxy(h) => h.lock().name().to_string(),
        })
    }

    pub fn is_interface(obj: &ValueItem) -> bool {
        obj.vtype().is_object()
    }
}
