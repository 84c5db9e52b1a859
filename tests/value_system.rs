//! 值系统跨模块场景

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use attacha::error::ValueError;
use attacha::runtime::{FuncEnvironment, Interface, SymbolTable};
use attacha::vm::{
    alloc_stats, check_access, compare_value, dyn_sum, hash_value, parse_value, AttachADynamicVirtualTable, ClassAccess, Item,
    MethodInfo, Structure, VTableRef, VType, ValueItem, ValueMeta, VirtualTable,
};

fn native<F>(name: &str, f: F) -> Arc<FuncEnvironment>
where
    F: Fn(&mut [ValueItem]) -> attacha::ValueResult<Option<ValueItem>> + Send + Sync + 'static,
{
    Arc::new(FuncEnvironment::native(name, f, None))
}

#[test]
fn copies_are_released_exactly_once() {
    let before = alloc_stats();
    {
        let original = ValueItem::array(vec![ValueItem::from("a"), ValueItem::from(2i32)]);
        let copy = original.try_clone().unwrap();
        let nested = ValueItem::array(vec![copy.try_clone().unwrap(), ValueItem::from("b")]);
        assert_eq!(nested.len().unwrap(), 2);
        assert_eq!(compare_value(&original, &copy), (true, false));
    }
    let after = alloc_stats();
    assert!(after.allocations > before.allocations);
    assert_eq!(after.allocations - before.allocations, after.frees - before.frees);
}

#[test]
fn move_leaves_source_noting() {
    let mut source = ValueItem::from("payload");
    let mut target = ValueItem::from(1i32);
    target.assign_move(&mut source).unwrap();
    assert!(source.is_noting());
    assert_eq!(target.to_script_string().unwrap(), "payload");
}

#[test]
fn stack_array_becomes_fixed_array_when_moved() {
    let mut stack = ValueItem::stack_array(vec![ValueItem::from(1u8), ValueItem::from(2u8), ValueItem::from(3u8)]);
    let moved = stack.take();
    assert_eq!(moved.vtype(), VType::Faarr);
    assert_eq!(moved.len().unwrap(), 3);
    assert!(stack.is_noting());
}

#[test]
fn async_resolution_is_idempotent() {
    let func = native("slow_square", |args| {
        let x = args[0].cast::<i64>()?;
        Ok(Some(ValueItem::from(x * x)))
    });
    let mut result = func.async_call(vec![ValueItem::from(9i64)]);
    result.get_async_result().unwrap();
    assert_eq!(result.vtype(), VType::I64);
    assert_eq!(result, ValueItem::from(81i64));

    result.get_async_result().unwrap();
    assert_eq!(result, ValueItem::from(81i64));
}

#[test]
fn failed_async_becomes_exception() {
    let func = native("fails", |_| Err(ValueError::InvalidArguments("no".to_string())));
    let mut result = func.async_call(Vec::new());
    assert!(matches!(result.get_async_result(), Err(ValueError::InvalidArguments(_))));
    assert_eq!(result.vtype(), VType::ExceptValue);
}

#[test]
fn array_comparison_stops_at_first_difference() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mut table = AttachADynamicVirtualTable::new("Probe");
    table.slots_mut().compare = Some(native("Probe::compare", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some(ValueItem::from(0i32)))
    }));
    let probe = || {
        let handle = Structure::construct_with_vtable(Vec::new(), VTableRef::Dynamic(Box::new(table.clone()))).unwrap();
        ValueItem::structure(handle)
    };

    let a = ValueItem::array(vec![ValueItem::from(1i32), probe()]);
    let b = ValueItem::array(vec![ValueItem::from(2i32), probe()]);
    assert_eq!(compare_value(&a, &b), (false, true));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn access_levels_fail_closed() {
    assert!(check_access(ClassAccess::Pub, ClassAccess::Pub));
    assert!(!check_access(ClassAccess::Priv, ClassAccess::Pub));
    assert!(!check_access(ClassAccess::Prot, ClassAccess::Pub));
    assert!(check_access(ClassAccess::Priv, ClassAccess::Prot));
    assert!(!check_access(ClassAccess::Intern, ClassAccess::Priv));
    assert!(check_access(ClassAccess::Intern, ClassAccess::Intern));

    let mut table = AttachADynamicVirtualTable::new("Vault");
    table.add_method(MethodInfo::new(
        "open",
        native("Vault::open", |_| Ok(Some(ValueItem::from(true)))),
        ClassAccess::Priv,
    ));
    let vault = ValueItem::structure(
        Structure::construct_with_vtable(Vec::new(), VTableRef::Dynamic(Box::new(table))).unwrap(),
    );
    assert!(matches!(
        Interface::make_call(ClassAccess::Pub, &vault, "open", Vec::new()),
        Err(ValueError::NotImplemented(_))
    ));
    let opened = Interface::make_call(ClassAccess::Priv, &vault, "open", Vec::new()).unwrap().unwrap();
    assert_eq!(opened, ValueItem::from(true));
}

#[test]
fn derive_refuses_to_replace_fixed_methods() {
    let mut child = AttachADynamicVirtualTable::new("Child");
    child.add_method(MethodInfo::new("id", native("Child::id", |_| Ok(None)), ClassAccess::Pub).fixed());

    let mut parent = AttachADynamicVirtualTable::new("Parent");
    parent.add_method(MethodInfo::new("extra", native("Parent::extra", |_| Ok(None)), ClassAccess::Pub));
    parent.add_method(MethodInfo::new("id", native("Parent::id", |_| Ok(None)), ClassAccess::Pub));

    assert!(matches!(child.derive(&parent), Err(ValueError::InvalidOperation(_))));
    assert_eq!(child.methods().len(), 1);
    assert!(!child.has_method("extra", ClassAccess::Pub));
}

#[test]
fn retag_negative_integer_to_double() {
    let mut value = ValueItem::from(-5i32);
    value.as_value(VType::Doub).unwrap();
    assert_eq!(value.vtype(), VType::Doub);
    assert_eq!(value.cast::<f64>().unwrap(), -5.0);
    assert_eq!(value.to_script_string().unwrap(), "-5.0");
}

#[test]
fn fractional_size_underflows() {
    assert!(matches!(ValueItem::from(5.7f64).get_size(), Err(ValueError::NumericUnderflow(_))));
    assert!(matches!(ValueItem::from(-1i32).get_size(), Err(ValueError::NumericUnderflow(_))));
    assert_eq!(ValueItem::from(4.0f32).get_size().unwrap(), 4);
}

#[test]
fn text_round_trip() {
    let value = parse_value("[1,2,3]");
    assert_eq!(value.vtype(), VType::Uarr);
    let text = value.to_script_string().unwrap();
    assert_eq!(text, "[1,2,3]");
    assert_eq!(parse_value(&text), value);
}

#[test]
fn symbol_conflict_then_reload() {
    let table = SymbolTable::new();
    table.add_native("greet", |_| Ok(Some(ValueItem::from("hi"))), None, true).unwrap();
    assert!(matches!(
        table.add_native("greet", |_| Ok(None), None, true),
        Err(ValueError::Symbol(_))
    ));
    table.unload("greet").unwrap();
    table.add_native("greet", |_| Ok(Some(ValueItem::from("hello"))), None, true).unwrap();
    let result = table.call("greet", Vec::new()).unwrap().unwrap();
    assert_eq!(result.to_script_string().unwrap(), "hello");
}

#[test]
fn readonly_operand_leaves_target_unchanged() {
    let a = ValueItem::from(3i32).with_allow_edit(false);
    let mut b = ValueItem::from(4i32);
    assert_eq!(dyn_sum(&mut b, &a), Err(ValueError::UnmodifiableValue));
    assert_eq!(b, ValueItem::from(4i32));
}

#[test]
fn struct_fields_through_interface() {
    let items = vec![
        Item::new("x", ValueMeta::of(VType::I32)),
        Item::bits("flag", ValueMeta::of(VType::Boolean), 1),
        Item::new("label", ValueMeta::of(VType::String)),
    ];
    let handle = Structure::construct(items).unwrap();
    handle.lock().set_fully_constructed();
    let value = ValueItem::structure(handle);

    Interface::set_value(ClassAccess::Pub, &value, "x", &ValueItem::from(7.9f64)).unwrap();
    Interface::set_value(ClassAccess::Pub, &value, "flag", &ValueItem::from(true)).unwrap();
    Interface::set_value(ClassAccess::Pub, &value, "label", &ValueItem::from("pt")).unwrap();

    assert_eq!(Interface::get_value(ClassAccess::Pub, &value, "x").unwrap(), ValueItem::from(7i32));
    assert_eq!(Interface::get_value(ClassAccess::Pub, &value, "flag").unwrap(), ValueItem::from(true));
    assert_eq!(
        Interface::get_value(ClassAccess::Pub, &value, "label").unwrap().to_script_string().unwrap(),
        "pt"
    );
    assert_eq!(Interface::name(&value).unwrap(), "struct");
}

fn ints(values: &[i32]) -> ValueItem {
    ValueItem::array(values.iter().map(|&v| ValueItem::from(v)).collect())
}

/// 通过 size + operator[]get 暴露元素的对象
fn indexable(values: &[i32]) -> ValueItem {
    let values: Arc<Vec<i32>> = Arc::new(values.to_vec());
    let len = values.len();
    let mut table = AttachADynamicVirtualTable::new("Indexable");
    table.add_method(MethodInfo::new(
        "size",
        native("Indexable::size", move |_| Ok(Some(ValueItem::from(len)))),
        ClassAccess::Pub,
    ));
    table.add_method(MethodInfo::new(
        "operator[]get",
        native("Indexable::get", move |args| {
            let index = args[1].get_size()?;
            Ok(Some(ValueItem::from(values[index])))
        }),
        ClassAccess::Pub,
    ));
    ValueItem::structure(Structure::construct_with_vtable(Vec::new(), VTableRef::Dynamic(Box::new(table))).unwrap())
}

/// 通过 size + begin/next 暴露元素的对象，游标存放在字段中
fn iterable(values: &[i32]) -> ValueItem {
    let values: Arc<Vec<i32>> = Arc::new(values.to_vec());
    let len = values.len();
    let mut table = AttachADynamicVirtualTable::new("Iterable");
    table.add_method(MethodInfo::new(
        "size",
        native("Iterable::size", move |_| Ok(Some(ValueItem::from(len)))),
        ClassAccess::Pub,
    ));
    table.add_method(MethodInfo::new(
        "begin",
        native("Iterable::begin", |args| {
            args[0].as_struct()?.lock().set_field(0, &ValueItem::from(0i32))?;
            Ok(None)
        }),
        ClassAccess::Pub,
    ));
    table.add_method(MethodInfo::new(
        "next",
        native("Iterable::next", move |args| {
            let handle = args[0].as_struct()?;
            let mut s = handle.lock();
            let cursor = s.get_field(0)?.get_size()?;
            s.set_field(0, &ValueItem::from(cursor as i32 + 1))?;
            Ok(Some(ValueItem::from(values[cursor])))
        }),
        ClassAccess::Pub,
    ));
    let items = vec![Item::new("cursor", ValueMeta::of(VType::I32))];
    ValueItem::structure(Structure::construct_with_vtable(items, VTableRef::Dynamic(Box::new(table))).unwrap())
}

#[test]
fn array_compares_with_indexable_object() {
    let obj = indexable(&[10, 20]);
    assert_eq!(compare_value(&ints(&[10, 20]), &obj), (true, false));
    assert_eq!(compare_value(&obj, &ints(&[10, 20])), (true, false));

    // 对象在左侧时按对象的元素作为左操作数
    assert_eq!(compare_value(&obj, &ints(&[10, 30])), (false, true));
    assert_eq!(compare_value(&ints(&[10, 30]), &obj), (false, false));

    assert_eq!(compare_value(&ints(&[10]), &obj), (false, true));
    assert_eq!(compare_value(&obj, &ints(&[10])), (false, false));
}

#[test]
fn array_compares_with_iterable_object() {
    let obj = iterable(&[1, 2, 3]);
    assert_eq!(compare_value(&ints(&[1, 2, 3]), &obj), (true, false));
    // begin 重置游标，重复比较得到相同结果
    assert_eq!(compare_value(&obj, &ints(&[1, 2, 3])), (true, false));
    assert_eq!(compare_value(&ints(&[1, 1, 9]), &obj), (false, true));
    assert_eq!(compare_value(&obj, &ints(&[1, 1, 9])), (false, false));
}

#[test]
fn array_against_plain_struct_is_incomparable() {
    let plain = ValueItem::structure(Structure::construct(Vec::new()).unwrap());
    assert_eq!(compare_value(&ints(&[1]), &plain), (false, false));
    assert_eq!(compare_value(&plain, &ints(&[1])), (false, false));
}

fn tagged_struct(id: i32, tag: &str) -> ValueItem {
    let handle = Structure::construct(vec![
        Item::new("id", ValueMeta::of(VType::I32)),
        Item::new("tag", ValueMeta::of(VType::String)),
    ])
    .unwrap();
    {
        let mut s = handle.lock();
        s.set_field(0, &ValueItem::from(id)).unwrap();
        s.set_field(1, &ValueItem::from(tag)).unwrap();
        s.set_fully_constructed();
    }
    ValueItem::structure(handle)
}

#[test]
fn structs_as_hash_keys_follow_equality() {
    let a = tagged_struct(1, "one");
    let b = a.try_clone().unwrap();
    assert_eq!(compare_value(&a, &b), (true, false));
    assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());

    let mut set = HashSet::new();
    set.insert(a.try_clone().unwrap());
    set.insert(b.try_clone().unwrap());
    set.insert(tagged_struct(2, "two"));
    assert_eq!(set.len(), 2);

    let mut left = HashMap::new();
    left.insert(a, ValueItem::from("v"));
    let mut right = HashMap::new();
    right.insert(b, ValueItem::from("v"));
    assert_eq!(compare_value(&ValueItem::from(left), &ValueItem::from(right)), (true, false));
}

#[test]
fn maps_as_hash_keys_follow_equality() {
    let key = || {
        let mut inner = HashMap::new();
        inner.insert(ValueItem::from(1i32), tagged_struct(7, "seven"));
        inner.insert(ValueItem::from("k"), ValueItem::from(2.0f64));
        ValueItem::from(inner)
    };
    let mut left = HashMap::new();
    left.insert(key(), ValueItem::from(true));
    let mut right = HashMap::new();
    right.insert(key(), ValueItem::from(true));
    assert_eq!(compare_value(&ValueItem::from(left), &ValueItem::from(right)), (true, false));

    let mut set = HashSet::new();
    set.insert(key());
    set.insert(key());
    assert_eq!(set.len(), 1);
}

#[test]
fn nested_async_call_on_busy_pool_completes() {
    let inner = native("inner", |args| Ok(Some(ValueItem::from(args[0].cast::<i64>()? * 2))));
    let outer = native("outer", move |args| {
        let mut pending = inner.async_call(vec![args[0].try_clone()?]);
        pending.get_async_result()?;
        Ok(Some(pending))
    });
    let mut results: Vec<ValueItem> = (0..64i64).map(|i| outer.async_call(vec![ValueItem::from(i)])).collect();
    for (i, result) in results.iter_mut().enumerate() {
        result.get_async_result().unwrap();
        assert_eq!(*result, ValueItem::from(i as i64 * 2));
    }
}
