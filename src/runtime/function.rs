//! 函数环境
//!
//! 每个可调用函数对应一个 `FuncEnvironment`：
//! - `Own`：字节码函数，首次调用时通过 `CodeBackend` 惰性编译，
//!   编译结果缓存在 `compiled` 中（同时起编译锁的作用，并发的首次调用只编译一次）
//! - `Native`：宿主闭包，带可选的参数模板
//! - `Python` / `CSharp` / `Java`：外部语言桩，调用时报未实现

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::task_pool::TaskPool;
use crate::error::{ValueError, ValueResult};
use crate::vm::meta::VType;
use crate::vm::value::ValueItem;

/// 原生函数
pub type NativeProc = Arc<dyn Fn(&mut [ValueItem]) -> ValueResult<Option<ValueItem>> + Send + Sync>;

/// 字节码编译器 / 解释器
pub trait CodeBackend: Send + Sync {
    /// 把字节码函数编译成可直接调用的形式
    fn compile(&self, env: &FuncEnvironment) -> ValueResult<NativeProc>;
}

/// 函数种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    Own,
    Native,
    Python,
    CSharp,
    Java,
}

// ============================================================================
// 函数模板
// ============================================================================

/// 参数模板
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentTemplate {
    pub name: String,
    /// 声明的标签，None 表示任意类型
    pub vtype: Option<VType>,
}

impl ArgumentTemplate {
    pub fn new(name: impl Into<String>, vtype: Option<VType>) -> Self {
        Self { name: name.into(), vtype }
    }
}

/// 函数签名
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionTemplate {
    pub arguments: Vec<ArgumentTemplate>,
    pub result: Option<VType>,
    /// 允许多于声明数量的参数
    pub is_variadic: bool,
}

impl FunctionTemplate {
    pub fn new(arguments: Vec<ArgumentTemplate>, result: Option<VType>) -> Self {
        Self { arguments, result, is_variadic: false }
    }

    pub fn variadic(mut self) -> Self {
        self.is_variadic = true;
        self
    }

    /// 检查参数个数并把参数转换为声明的标签
    pub fn prepare(&self, args: &mut [ValueItem]) -> ValueResult<()> {
        let expected = self.arguments.len();
        if args.len() < expected || (!self.is_variadic && args.len() > expected) {
            return Err(ValueError::InvalidArguments(format!(
                "expected {}{} arguments, got {}",
                if self.is_variadic { "at least " } else { "" },
                expected,
                args.len()
            )));
        }
        for (arg, template) in args.iter_mut().zip(&self.arguments) {
            if let Some(vtype) = template.vtype {
                if arg.vtype() != vtype && !arg.is_ref() {
                    arg.set_allow_edit(true);
                    arg.as_value(vtype)?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// 函数环境
// ============================================================================

pub struct FuncEnvironment {
    name: String,
    kind: FuncKind,
    template: Option<FunctionTemplate>,
    native: Option<NativeProc>,
    code: Arc<[u8]>,
    local_funcs: Vec<Arc<FuncEnvironment>>,
    backend: Option<Arc<dyn CodeBackend>>,
    /// 编译锁 + 编译结果
    compiled: Mutex<Option<NativeProc>>,
    can_be_unloaded: bool,
}

impl FuncEnvironment {
    /// 原生函数
    pub fn native<F>(name: impl Into<String>, proc: F, template: Option<FunctionTemplate>) -> Self
    where
        F: Fn(&mut [ValueItem]) -> ValueResult<Option<ValueItem>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: FuncKind::Native,
            template,
            native: Some(Arc::new(proc)),
            code: Arc::from(Vec::new()),
            local_funcs: Vec::new(),
            backend: None,
            compiled: Mutex::new(None),
            can_be_unloaded: true,
        }
    }

    /// 字节码函数
    pub fn own(name: impl Into<String>, code: Vec<u8>, backend: Arc<dyn CodeBackend>) -> Self {
        Self {
            name: name.into(),
            kind: FuncKind::Own,
            template: None,
            native: None,
            code: Arc::from(code),
            local_funcs: Vec::new(),
            backend: Some(backend),
            compiled: Mutex::new(None),
            can_be_unloaded: true,
        }
    }

    /// 外部语言函数桩
    pub fn foreign(name: impl Into<String>, kind: FuncKind) -> Self {
        Self {
            name: name.into(),
            kind,
            template: None,
            native: None,
            code: Arc::from(Vec::new()),
            local_funcs: Vec::new(),
            backend: None,
            compiled: Mutex::new(None),
            can_be_unloaded: true,
        }
    }

    pub fn with_template(mut self, template: FunctionTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_local_funcs(mut self, local_funcs: Vec<Arc<FuncEnvironment>>) -> Self {
        self.local_funcs = local_funcs;
        self
    }

    pub fn with_unloadable(mut self, can_be_unloaded: bool) -> Self {
        self.can_be_unloaded = can_be_unloaded;
        self
    }

    // ========== 查询 ==========

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FuncKind {
        self.kind
    }

    pub fn template(&self) -> Option<&FunctionTemplate> {
        self.template.as_ref()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn local_funcs(&self) -> &[Arc<FuncEnvironment>] {
        &self.local_funcs
    }

    pub fn can_be_unloaded(&self) -> bool {
        self.can_be_unloaded
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.lock().is_some()
    }

    // ========== 调用 ==========

    /// 检查签名后调用
    pub fn sync_wrapper(&self, args: &mut [ValueItem]) -> ValueResult<Option<ValueItem>> {
        if let Some(template) = &self.template {
            template.prepare(args)?;
        }
        let result = self.invoke(args)?;
        match (result, self.template.as_ref().and_then(|t| t.result)) {
            (Some(mut value), Some(vtype)) if value.vtype() != vtype => {
                value.set_allow_edit(true);
                value.as_value(vtype)?;
                Ok(Some(value))
            }
            (result, _) => Ok(result),
        }
    }

    /// 同步调用
    pub fn sync_call(&self, mut args: Vec<ValueItem>) -> ValueResult<Option<ValueItem>> {
        self.sync_wrapper(&mut args)
    }

    /// 异步调用：提交到任务池，立即返回 async_res 值
    pub fn async_call(self: &Arc<Self>, args: Vec<ValueItem>) -> ValueItem {
        let func = Arc::clone(self);
        let result = TaskPool::global().spawn(move || func.sync_call(args));
        ValueItem::async_result(result)
    }

    fn invoke(&self, args: &mut [ValueItem]) -> ValueResult<Option<ValueItem>> {
        match self.kind {
            FuncKind::Native => match &self.native {
                Some(proc) => proc(args),
                None => Err(ValueError::InvalidOperation(format!("{} has no native body", self.name))),
            },
            FuncKind::Own => {
                let proc = self.compiled_proc()?;
                proc(args)
            }
            FuncKind::Python | FuncKind::CSharp | FuncKind::Java => Err(ValueError::NotImplemented(format!(
                "{:?} functions are not supported: {}",
                self.kind, self.name
            ))),
        }
    }

    /// 惰性编译，并发的首次调用在编译锁上排队
    fn compiled_proc(&self) -> ValueResult<NativeProc> {
        let mut compiled = self.compiled.lock();
        if let Some(proc) = compiled.as_ref() {
            return Ok(Arc::clone(proc));
        }
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| ValueError::InvalidOperation(format!("{} has no code backend", self.name)))?;
        tracing::debug!(function = %self.name, bytes = self.code.len(), "compiling function");
        let proc = backend.compile(self)?;
        *compiled = Some(Arc::clone(&proc));
        Ok(proc)
    }
}

impl fmt::Debug for FuncEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncEnvironment")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("can_be_unloaded", &self.can_be_unloaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        compiles: AtomicUsize,
    }

    impl CodeBackend for CountingBackend {
        fn compile(&self, env: &FuncEnvironment) -> ValueResult<NativeProc> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            let len = env.code().len() as u64;
            Ok(Arc::new(move |_args: &mut [ValueItem]| Ok(Some(ValueItem::from(len)))))
        }
    }

    #[test]
    fn test_native_template_coerces() {
        let template = FunctionTemplate::new(
            vec![
                ArgumentTemplate::new("a", Some(VType::Doub)),
                ArgumentTemplate::new("b", None),
            ],
            Some(VType::I64),
        );
        let func = FuncEnvironment::native(
            "add",
            |args| {
                assert_eq!(args[0].vtype(), VType::Doub);
                let sum = args[0].cast::<f64>()? + args[1].cast::<f64>()?;
                Ok(Some(ValueItem::from(sum)))
            },
            Some(template),
        );
        let result = func
            .sync_call(vec![ValueItem::from(2i32), ValueItem::from(3.5f32)])
            .unwrap()
            .unwrap();
        assert_eq!(result.vtype(), VType::I64);
        assert_eq!(result, ValueItem::from(5i64));

        assert!(matches!(
            func.sync_call(vec![ValueItem::from(1i32)]),
            Err(ValueError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_variadic_accepts_extra() {
        let template = FunctionTemplate::new(vec![ArgumentTemplate::new("first", None)], None).variadic();
        let func = FuncEnvironment::native("count", |args| Ok(Some(ValueItem::from(args.len()))), Some(template));
        let result = func.sync_call((0..4).map(ValueItem::from).collect()).unwrap().unwrap();
        assert_eq!(result, ValueItem::from(4u64));
    }

    #[test]
    fn test_lazy_compile_once() {
        let backend = Arc::new(CountingBackend { compiles: AtomicUsize::new(0) });
        let func = Arc::new(FuncEnvironment::own("main", vec![1, 2, 3], backend.clone()));
        assert!(!func.is_compiled());

        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..8 {
                let func = Arc::clone(&func);
                scope.spawn(move |_| {
                    let result = func.sync_call(Vec::new()).unwrap().unwrap();
                    assert_eq!(result, ValueItem::from(3u64));
                });
            }
        })
        .unwrap();

        assert!(func.is_compiled());
        assert_eq!(backend.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_foreign_not_implemented() {
        let func = FuncEnvironment::foreign("py_fn", FuncKind::Python);
        assert!(matches!(func.sync_call(Vec::new()), Err(ValueError::NotImplemented(_))));
    }

    #[test]
    fn test_async_call_resolves() {
        let func = Arc::new(FuncEnvironment::native(
            "double",
            |args| Ok(Some(ValueItem::from(args[0].cast::<i32>()? * 2))),
            None,
        ));
        let mut pending = func.async_call(vec![ValueItem::from(21i32)]);
        assert_eq!(pending.vtype(), VType::AsyncRes);
        pending.get_async_result().unwrap();
        assert_eq!(pending, ValueItem::from(42i32));
        pending.get_async_result().unwrap();
        assert_eq!(pending.vtype(), VType::I32);
    }
}
