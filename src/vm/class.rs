//! 类对象
//!
//! 除结构体外，接口层还需要派发到三种对象：
//! - `ClassValue`：具名字段（带访问级别）加共享的静态虚表
//! - `MorphValue`：字段和方法都可以在运行时增删
//! - `ProxyClass`：包装一个宿主值，方法调用时宿主值作为 self

use std::sync::Arc;

use super::value::ValueItem;
use super::vtable::{
    check_access, AttachADynamicVirtualTable, AttachAVirtualTable, ClassAccess, MethodInfo, VirtualTable,
};
use crate::error::{ValueError, ValueResult};
use crate::runtime::function::FuncEnvironment;

/// 类字段
#[derive(Debug)]
pub struct ClassField {
    pub name: String,
    pub access: ClassAccess,
    pub value: ValueItem,
}

impl ClassField {
    pub fn new(name: impl Into<String>, access: ClassAccess, value: ValueItem) -> Self {
        Self { name: name.into(), access, value }
    }

    fn try_clone(&self) -> ValueResult<Self> {
        Ok(Self {
            name: self.name.clone(),
            access: self.access,
            value: self.value.try_clone()?,
        })
    }
}

fn find_field<'a>(fields: &'a [ClassField], name: &str, access: ClassAccess) -> ValueResult<&'a ClassField> {
    fields
        .iter()
        .find(|f| f.name == name && check_access(f.access, access))
        .ok_or_else(|| ValueError::InvalidArguments(format!("no accessible field {}", name)))
}

fn find_field_mut<'a>(
    fields: &'a mut [ClassField],
    name: &str,
    access: ClassAccess,
) -> ValueResult<&'a mut ClassField> {
    fields
        .iter_mut()
        .find(|f| f.name == name && check_access(f.access, access))
        .ok_or_else(|| ValueError::InvalidArguments(format!("no accessible field {}", name)))
}

fn clone_fields(fields: &[ClassField]) -> ValueResult<Vec<ClassField>> {
    fields.iter().map(ClassField::try_clone).collect()
}

// ============================================================================
// ClassValue
// ============================================================================

/// 类实例
pub struct ClassValue {
    name: String,
    fields: Vec<ClassField>,
    vtable: Arc<AttachAVirtualTable>,
}

impl ClassValue {
    pub fn new(name: impl Into<String>, fields: Vec<ClassField>, vtable: Arc<AttachAVirtualTable>) -> Self {
        Self { name: name.into(), fields, vtable }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_method(&self, name: &str, access: ClassAccess) -> Option<Arc<FuncEnvironment>> {
        self.vtable.get_method(name, access)
    }

    pub fn get_value(&self, name: &str, access: ClassAccess) -> ValueResult<ValueItem> {
        find_field(&self.fields, name, access)?.value.try_clone()
    }

    pub fn set_value(&mut self, name: &str, access: ClassAccess, value: &ValueItem) -> ValueResult<()> {
        find_field_mut(&mut self.fields, name, access)?.value.assign(value)
    }

    pub fn try_clone(&self) -> ValueResult<Self> {
        Ok(Self {
            name: self.name.clone(),
            fields: clone_fields(&self.fields)?,
            vtable: Arc::clone(&self.vtable),
        })
    }
}

// ============================================================================
// MorphValue
// ============================================================================

/// 可变形对象
pub struct MorphValue {
    fields: Vec<ClassField>,
    methods: AttachADynamicVirtualTable,
}

impl MorphValue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            fields: Vec::new(),
            methods: AttachADynamicVirtualTable::new(name),
        }
    }

    pub fn name(&self) -> &str {
        self.methods.name()
    }

    /// 添加字段（已存在的同名字段被替换）
    pub fn add_field(&mut self, field: ClassField) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    pub fn remove_field(&mut self, name: &str, access: ClassAccess) -> ValueResult<ValueItem> {
        let index = self
            .fields
            .iter()
            .position(|f| f.name == name && check_access(f.access, access))
            .ok_or_else(|| ValueError::InvalidArguments(format!("no accessible field {}", name)))?;
        Ok(self.fields.remove(index).value)
    }

    pub fn add_method(&mut self, method: MethodInfo) {
        self.methods.add_method(method);
    }

    pub fn remove_method(&mut self, name: &str, access: ClassAccess) -> ValueResult<()> {
        self.methods.remove_method(name, access)
    }

    pub fn methods(&self) -> &AttachADynamicVirtualTable {
        &self.methods
    }

    pub fn methods_mut(&mut self) -> &mut AttachADynamicVirtualTable {
        &mut self.methods
    }

    pub fn get_method(&self, name: &str, access: ClassAccess) -> Option<Arc<FuncEnvironment>> {
        self.methods.get_method(name, access)
    }

    pub fn get_value(&self, name: &str, access: ClassAccess) -> ValueResult<ValueItem> {
        find_field(&self.fields, name, access)?.value.try_clone()
    }

    pub fn set_value(&mut self, name: &str, access: ClassAccess, value: &ValueItem) -> ValueResult<()> {
        find_field_mut(&mut self.fields, name, access)?.value.assign(value)
    }

    pub fn try_clone(&self) -> ValueResult<Self> {
        Ok(Self {
            fields: clone_fields(&self.fields)?,
            methods: self.methods.clone(),
        })
    }
}

// ============================================================================
// ProxyClass
// ============================================================================

/// 宿主值代理
pub struct ProxyClass {
    host: ValueItem,
    vtable: Arc<AttachAVirtualTable>,
}

impl ProxyClass {
    pub fn new(host: ValueItem, vtable: Arc<AttachAVirtualTable>) -> Self {
        Self { host, vtable }
    }

    pub fn name(&self) -> &str {
        self.vtable.name()
    }

    pub fn host(&self) -> &ValueItem {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut ValueItem {
        &mut self.host
    }

    /// 作为 self 传入的宿主值：能引用时传引用，否则传副本
    pub fn host_as_self(&self) -> ValueResult<ValueItem> {
        match self.host.reference() {
            Ok(r) => Ok(r),
            Err(_) => self.host.try_clone(),
        }
    }

    pub fn get_method(&self, name: &str, access: ClassAccess) -> Option<Arc<FuncEnvironment>> {
        self.vtable.get_method(name, access)
    }

    pub fn try_clone(&self) -> ValueResult<Self> {
        Ok(Self {
            host: self.host.try_clone()?,
            vtable: Arc::clone(&self.vtable),
        })
    }
}
