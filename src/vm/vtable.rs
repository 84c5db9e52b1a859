//! VTable（虚方法表）实现
//!
//! 用户定义的对象类型通过虚表派发方法：
//! - `AttachAVirtualTable`：静态虚表，构造后不可修改，可在多个结构体间共享
//! - `AttachADynamicVirtualTable`：动态虚表，支持运行时增删方法和 `derive`
//!
//! 方法查找是按声明顺序的线性扫描，第一个名字和访问级别都满足的条目胜出。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ValueError, ValueResult};
use crate::runtime::function::{FuncEnvironment, FunctionTemplate};

// ============================================================================
// 访问控制
// ============================================================================

/// 成员访问级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassAccess {
    Pub,
    Priv,
    Prot,
    Intern,
}

/// 检查以 `required` 级别访问声明为 `declared` 的成员是否允许
///
/// - pub 成员总是可见
/// - prot/priv 成员对非纯公开访问可见
/// - intern 成员只对 intern 访问可见
#[inline]
pub fn check_access(declared: ClassAccess, required: ClassAccess) -> bool {
    match declared {
        ClassAccess::Pub => true,
        ClassAccess::Prot | ClassAccess::Priv => required != ClassAccess::Pub,
        ClassAccess::Intern => required == ClassAccess::Intern,
    }
}

// ============================================================================
// 方法条目
// ============================================================================

/// 方法信息
#[derive(Clone)]
pub struct MethodInfo {
    pub name: String,
    pub access: ClassAccess,
    pub function: Arc<FuncEnvironment>,
    /// 是否允许被删除或被 derive 替换
    pub deletable: bool,
    pub signature: Option<FunctionTemplate>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>, function: Arc<FuncEnvironment>, access: ClassAccess) -> Self {
        Self {
            name: name.into(),
            access,
            function,
            deletable: true,
            signature: None,
        }
    }

    /// 标记为不可删除
    pub fn fixed(mut self) -> Self {
        self.deletable = false;
        self
    }

    pub fn with_signature(mut self, signature: FunctionTemplate) -> Self {
        self.signature = Some(signature);
        self
    }
}

impl fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInfo")
            .field("name", &self.name)
            .field("access", &self.access)
            .field("function", &self.function.name())
            .field("deletable", &self.deletable)
            .finish()
    }
}

/// 特殊槽位
#[derive(Clone, Default)]
pub struct VTableSlots {
    pub destructor: Option<Arc<FuncEnvironment>>,
    pub copy: Option<Arc<FuncEnvironment>>,
    pub move_: Option<Arc<FuncEnvironment>>,
    pub compare: Option<Arc<FuncEnvironment>>,
}

impl VTableSlots {
    /// 用 `other` 填补空槽位
    fn fill_from(&mut self, other: &VTableSlots) {
        if self.destructor.is_none() {
            self.destructor = other.destructor.clone();
        }
        if self.copy.is_none() {
            self.copy = other.copy.clone();
        }
        if self.move_.is_none() {
            self.move_ = other.move_.clone();
        }
        if self.compare.is_none() {
            self.compare = other.compare.clone();
        }
    }
}

// ============================================================================
// 虚表
// ============================================================================

/// 两种虚表共有的只读接口
pub trait VirtualTable: Send + Sync {
    fn name(&self) -> &str;
    fn methods(&self) -> &[MethodInfo];
    fn slots(&self) -> &VTableSlots;
    fn tags(&self) -> &HashMap<String, String>;

    /// 查找方法信息
    fn get_method_info(&self, name: &str, access: ClassAccess) -> Option<&MethodInfo> {
        self.methods()
            .iter()
            .find(|m| m.name == name && check_access(m.access, access))
    }

    fn get_method(&self, name: &str, access: ClassAccess) -> Option<Arc<FuncEnvironment>> {
        self.get_method_info(name, access).map(|m| Arc::clone(&m.function))
    }

    fn has_method(&self, name: &str, access: ClassAccess) -> bool {
        self.get_method_info(name, access).is_some()
    }
}

/// 静态虚表
#[derive(Clone, Default)]
pub struct AttachAVirtualTable {
    name: String,
    methods: Vec<MethodInfo>,
    slots: VTableSlots,
    tags: HashMap<String, String>,
}

impl AttachAVirtualTable {
    pub fn new(name: impl Into<String>, methods: Vec<MethodInfo>, slots: VTableSlots) -> Self {
        Self {
            name: name.into(),
            methods,
            slots,
            tags: HashMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }
}

impl VirtualTable for AttachAVirtualTable {
    fn name(&self) -> &str {
        &self.name
    }
    fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
    fn slots(&self) -> &VTableSlots {
        &self.slots
    }
    fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }
}

/// 动态虚表
#[derive(Clone, Default)]
pub struct AttachADynamicVirtualTable {
    name: String,
    methods: Vec<MethodInfo>,
    slots: VTableSlots,
    tags: HashMap<String, String>,
}

impl AttachADynamicVirtualTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 从静态虚表复制出可修改的版本
    pub fn from_static(table: &AttachAVirtualTable) -> Self {
        Self {
            name: table.name.clone(),
            methods: table.methods.clone(),
            slots: table.slots.clone(),
            tags: table.tags.clone(),
        }
    }

    /// 追加方法（同名方法按声明顺序遮蔽）
    pub fn add_method(&mut self, method: MethodInfo) {
        self.methods.push(method);
    }

    /// 删除方法，只允许删除可删除的条目
    pub fn remove_method(&mut self, name: &str, access: ClassAccess) -> ValueResult<()> {
        let index = self
            .methods
            .iter()
            .position(|m| m.name == name && check_access(m.access, access))
            .ok_or_else(|| {
                ValueError::InvalidOperation(format!("method {} not found in {}", name, self.name))
            })?;
        if !self.methods[index].deletable {
            return Err(ValueError::InvalidOperation(format!(
                "method {} of {} is not deletable",
                name, self.name
            )));
        }
        self.methods.remove(index);
        Ok(())
    }

    /// 合并父虚表的方法
    ///
    /// 不存在的方法追加到末尾，已存在且可删除的被替换，
    /// 已存在但不可删除时整体失败，虚表保持不变
    pub fn derive(&mut self, parent: &dyn VirtualTable) -> ValueResult<()> {
        let mut plan = Vec::with_capacity(parent.methods().len());
        for method in parent.methods() {
            let existing = self
                .methods
                .iter()
                .position(|m| m.name == method.name && m.access == method.access);
            if let Some(index) = existing {
                if !self.methods[index].deletable {
                    return Err(ValueError::InvalidOperation(format!(
                        "cannot derive {} from {}: method {} is not deletable",
                        self.name,
                        parent.name(),
                        method.name
                    )));
                }
            }
            plan.push((existing, method.clone()));
        }

        for (existing, method) in plan {
            match existing {
                Some(index) => self.methods[index] = method,
                None => self.methods.push(method),
            }
        }
        self.slots.fill_from(parent.slots());
        for (k, v) in parent.tags() {
            self.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Ok(())
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn slots_mut(&mut self) -> &mut VTableSlots {
        &mut self.slots
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }
}

impl VirtualTable for AttachADynamicVirtualTable {
    fn name(&self) -> &str {
        &self.name
    }
    fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
    fn slots(&self) -> &VTableSlots {
        &self.slots
    }
    fn tags(&self) -> &HashMap<String, String> {
        &self.tags
    }
}

// ============================================================================
// 结构体持有的虚表
// ============================================================================

/// 虚表模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VTableMode {
    Disabled,
    AttachAVirtualTable,
    AttachADynamicVirtualTable,
    /// 外部运行时提供的虚表，值系统不解释
    Foreign,
}

/// 结构体持有的虚表
#[derive(Clone, Default)]
pub enum VTableRef {
    #[default]
    Disabled,
    Static(Arc<AttachAVirtualTable>),
    Dynamic(Box<AttachADynamicVirtualTable>),
    Foreign(String),
}

impl VTableRef {
    pub fn mode(&self) -> VTableMode {
        match self {
            VTableRef::Disabled => VTableMode::Disabled,
            VTableRef::Static(_) => VTableMode::AttachAVirtualTable,
            VTableRef::Dynamic(_) => VTableMode::AttachADynamicVirtualTable,
            VTableRef::Foreign(_) => VTableMode::Foreign,
        }
    }

    /// 可查找方法的虚表
    pub fn table(&self) -> Option<&dyn VirtualTable> {
        match self {
            VTableRef::Static(t) => Some(t.as_ref()),
            VTableRef::Dynamic(t) => Some(t.as_ref()),
            VTableRef::Disabled | VTableRef::Foreign(_) => None,
        }
    }

    /// 可修改的动态虚表（其他模式报错）
    pub fn dynamic_mut(&mut self) -> ValueResult<&mut AttachADynamicVirtualTable> {
        match self {
            VTableRef::Dynamic(t) => Ok(t.as_mut()),
            other => Err(ValueError::InvalidOperation(format!(
                "vtable in {:?} mode cannot be edited",
                other.mode()
            ))),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            VTableRef::Foreign(name) => Some(name),
            other => other.table().map(|t| t.name()),
        }
    }
}
