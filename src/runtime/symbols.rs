//! 全局符号表
//!
//! 名字到函数环境的并发映射。进程内有一个全局实例，也可以单独创建实例（测试用）。

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::function::{CodeBackend, FuncEnvironment, FunctionTemplate};
use crate::error::{ValueError, ValueResult};
use crate::vm::value::ValueItem;

pub struct SymbolTable {
    functions: DashMap<String, Arc<FuncEnvironment>>,
    backend: OnceLock<Arc<dyn CodeBackend>>,
}

static GLOBAL_SYMBOLS: OnceLock<SymbolTable> = OnceLock::new();

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
            backend: OnceLock::new(),
        }
    }

    pub fn global() -> &'static SymbolTable {
        GLOBAL_SYMBOLS.get_or_init(SymbolTable::new)
    }

    /// 设置字节码后端（只能设置一次）
    pub fn set_backend(&self, backend: Arc<dyn CodeBackend>) -> ValueResult<()> {
        self.backend
            .set(backend)
            .map_err(|_| ValueError::InvalidOperation("code backend already set".to_string()))
    }

    /// 注册原生函数，名字已存在时报错
    pub fn add_native<F>(
        &self,
        name: &str,
        proc: F,
        template: Option<FunctionTemplate>,
        can_be_unloaded: bool,
    ) -> ValueResult<Arc<FuncEnvironment>>
    where
        F: Fn(&mut [ValueItem]) -> ValueResult<Option<ValueItem>> + Send + Sync + 'static,
    {
        let env = FuncEnvironment::native(name, proc, template).with_unloadable(can_be_unloaded);
        self.insert(Arc::new(env))
    }

    /// 注册字节码函数，使用已设置的后端
    pub fn load(&self, name: &str, code: Vec<u8>, can_be_unloaded: bool) -> ValueResult<Arc<FuncEnvironment>> {
        let backend = self
            .backend
            .get()
            .cloned()
            .ok_or_else(|| ValueError::InvalidOperation("no code backend registered".to_string()))?;
        let env = FuncEnvironment::own(name, code, backend).with_unloadable(can_be_unloaded);
        self.insert(Arc::new(env))
    }

    /// 注册已构建的函数环境
    pub fn insert(&self, env: Arc<FuncEnvironment>) -> ValueResult<Arc<FuncEnvironment>> {
        match self.functions.entry(env.name().to_string()) {
            Entry::Occupied(entry) => Err(ValueError::Symbol(format!("symbol {} already defined", entry.key()))),
            Entry::Vacant(entry) => {
                tracing::debug!(symbol = env.name(), kind = ?env.kind(), "symbol added");
                entry.insert(Arc::clone(&env));
                Ok(env)
            }
        }
    }

    /// 卸载函数；不存在或不可卸载时报错
    ///
    /// 已取得该函数的调用方仍可继续使用它
    pub fn unload(&self, name: &str) -> ValueResult<()> {
        match self.functions.entry(name.to_string()) {
            Entry::Vacant(_) => Err(ValueError::Symbol(format!("symbol {} not found", name))),
            Entry::Occupied(entry) if !entry.get().can_be_unloaded() => {
                Err(ValueError::Symbol(format!("symbol {} cannot be unloaded", name)))
            }
            Entry::Occupied(entry) => {
                entry.remove();
                tracing::debug!(symbol = name, "symbol unloaded");
                Ok(())
            }
        }
    }

    /// 忽略可卸载标记强制移除，返回是否存在
    pub fn force_unload(&self, name: &str) -> bool {
        let removed = self.functions.remove(name).is_some();
        if removed {
            tracing::debug!(symbol = name, "symbol force unloaded");
        }
        removed
    }

    /// 热替换：用新的原生实现替换可卸载的函数
    pub fn fast_hot_path<F>(&self, name: &str, proc: F) -> ValueResult<Arc<FuncEnvironment>>
    where
        F: Fn(&mut [ValueItem]) -> ValueResult<Option<ValueItem>> + Send + Sync + 'static,
    {
        match self.functions.get_mut(name) {
            None => Err(ValueError::HotPath(format!("symbol {} not found", name))),
            Some(entry) if !entry.can_be_unloaded() => {
                Err(ValueError::HotPath(format!("symbol {} is not replaceable", name)))
            }
            Some(mut entry) => {
                let template = entry.template().cloned();
                let env = Arc::new(FuncEnvironment::native(name, proc, template));
                *entry = Arc::clone(&env);
                tracing::debug!(symbol = name, "symbol hot patched");
                Ok(env)
            }
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn environment(&self, name: &str) -> ValueResult<Arc<FuncEnvironment>> {
        self.functions
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ValueError::Symbol(format!("symbol {} not found", name)))
    }

    /// 按名字同步调用
    pub fn call(&self, name: &str, args: Vec<ValueItem>) -> ValueResult<Option<ValueItem>> {
        // 先取出函数再调用，调用期间不持有分片锁
        let env = self.environment(name)?;
        env.sync_call(args)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::function::NativeProc;

    struct EchoBackend;

    impl CodeBackend for EchoBackend {
        fn compile(&self, env: &FuncEnvironment) -> ValueResult<NativeProc> {
            let first = env.code().first().copied().unwrap_or(0);
            Ok(Arc::new(move |_args: &mut [ValueItem]| Ok(Some(ValueItem::from(first)))))
        }
    }

    #[test]
    fn test_add_conflict_unload() {
        let table = SymbolTable::new();
        table.add_native("f", |_| Ok(None), None, true).unwrap();
        assert!(matches!(
            table.add_native("f", |_| Ok(None), None, true),
            Err(ValueError::Symbol(_))
        ));
        table.unload("f").unwrap();
        assert!(!table.exists("f"));
        table.add_native("f", |_| Ok(Some(ValueItem::from(1i32))), None, true).unwrap();
        assert_eq!(table.call("f", Vec::new()).unwrap().unwrap(), ValueItem::from(1i32));
    }

    #[test]
    fn test_pinned_symbol() {
        let table = SymbolTable::new();
        table.add_native("core", |_| Ok(None), None, false).unwrap();
        assert!(matches!(table.unload("core"), Err(ValueError::Symbol(_))));
        assert!(matches!(
            table.fast_hot_path("core", |_| Ok(None)),
            Err(ValueError::HotPath(_))
        ));
        assert!(table.force_unload("core"));
        assert!(!table.force_unload("core"));
        assert!(matches!(table.unload("missing"), Err(ValueError::Symbol(_))));
    }

    #[test]
    fn test_hot_path_replaces() {
        let table = SymbolTable::new();
        let old = table.add_native("v", |_| Ok(Some(ValueItem::from(1i32))), None, true).unwrap();
        table.fast_hot_path("v", |_| Ok(Some(ValueItem::from(2i32)))).unwrap();
        assert_eq!(table.call("v", Vec::new()).unwrap().unwrap(), ValueItem::from(2i32));
        // 旧句柄仍然可用
        assert_eq!(old.sync_call(Vec::new()).unwrap().unwrap(), ValueItem::from(1i32));
        assert!(matches!(table.fast_hot_path("nope", |_| Ok(None)), Err(ValueError::HotPath(_))));
    }

    #[test]
    fn test_load_bytecode() {
        let table = SymbolTable::new();
        assert!(table.load("main", vec![7], true).is_err());
        table.set_backend(Arc::new(EchoBackend)).unwrap();
        assert!(table.set_backend(Arc::new(EchoBackend)).is_err());
        table.load("main", vec![7], true).unwrap();
        assert_eq!(table.call("main", Vec::new()).unwrap().unwrap(), ValueItem::from(7u8));
        assert_eq!(table.len(), 1);
    }
}
