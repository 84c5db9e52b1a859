//! 文本到值的解析
//!
//! `to_script_string` 的逆操作。小型递归下降：先识别字面量形式，
//! 再依次尝试 i32 → u32 → i64 → u64 → f32 → f64，都失败时作为普通字符串。

use std::collections::{HashMap, HashSet};

use super::value::ValueItem;

/// 解析文本形式的值（总是成功，无法识别的文本成为字符串）
pub fn parse_value(text: &str) -> ValueItem {
    let s = text.trim();
    match s {
        "null" => return ValueItem::null(),
        "true" => return ValueItem::from(true),
        "false" => return ValueItem::from(false),
        // 转义单引号的特例
        r"'\''" => return ValueItem::from("'"),
        _ => {}
    }

    if let Some(inner) = strip_quotes(s) {
        return ValueItem::from(inner);
    }
    if let Some(hex) = s.strip_prefix("0x") {
        if let Ok(ptr) = usize::from_str_radix(hex, 16) {
            return ValueItem::undefined_ptr(ptr);
        }
    }
    if let Some(inner) = enclosed(s, "*[", "]") {
        return ValueItem::fixed_array(parse_list(inner));
    }
    if let Some(inner) = enclosed(s, "[", "]") {
        return ValueItem::array(parse_list(inner));
    }
    if let Some(inner) = enclosed(s, "{", "}") {
        if let Some(map) = parse_map(inner) {
            return ValueItem::from(map);
        }
    }
    if let Some(inner) = enclosed(s, "t(", ")") {
        if let Ok(nanos) = inner.trim().parse::<i64>() {
            return ValueItem::time_point(nanos);
        }
    }
    if let Some(inner) = enclosed(s, "(", ")") {
        let set: HashSet<ValueItem> = parse_list(inner).into_iter().collect();
        return ValueItem::from(set);
    }
    parse_number(s).unwrap_or_else(|| ValueItem::from(text))
}

fn parse_number(s: &str) -> Option<ValueItem> {
    if let Ok(v) = s.parse::<i32>() {
        return Some(ValueItem::from(v));
    }
    if let Ok(v) = s.parse::<u32>() {
        return Some(ValueItem::from(v));
    }
    if let Ok(v) = s.parse::<i64>() {
        return Some(ValueItem::from(v));
    }
    if let Ok(v) = s.parse::<u64>() {
        return Some(ValueItem::from(v));
    }
    // 只有能原样打印回来的才当作 f32
    if let Ok(v) = s.parse::<f32>() {
        let text = ValueItem::from(v).to_script_string().ok()?;
        if text == s {
            return Some(ValueItem::from(v));
        }
    }
    s.parse::<f64>().ok().map(ValueItem::from)
}

fn strip_quotes(s: &str) -> Option<&str> {
    if s.len() < 2 {
        return None;
    }
    let quote = s.chars().next()?;
    if (quote == '"' || quote == '\'') && s.ends_with(quote) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn enclosed<'a>(s: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let inner = s.strip_prefix(open)?.strip_suffix(close)?;
    // 括号必须和末尾的闭括号配对，例如 "(1)(2)" 不是集合
    if split_top_level(inner, None).is_some() {
        Some(inner)
    } else {
        None
    }
}

fn parse_list(inner: &str) -> Vec<ValueItem> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    split_top_level(inner, Some(','))
        .unwrap_or_default()
        .into_iter()
        .map(parse_value)
        .collect()
}

fn parse_map(inner: &str) -> Option<HashMap<ValueItem, ValueItem>> {
    let mut map = HashMap::new();
    if inner.trim().is_empty() {
        return Some(map);
    }
    for entry in split_top_level(inner, Some(','))? {
        let parts = split_top_level(entry, Some(':'))?;
        if parts.len() < 2 {
            return None;
        }
        // 值部分可能包含顶层冒号以外的内容，只在第一个冒号处拆分
        let key_len = parts[0].len();
        let key = parse_value(parts[0]);
        let value = parse_value(&entry[key_len + 1..]);
        map.insert(key, value);
    }
    Some(map)
}

/// 在顶层（不在引号或括号内）按分隔符拆分
///
/// 括号不配对时返回 None；`sep` 为 None 时只做配对检查
fn split_top_level(s: &str, sep: Option<char>) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth = depth.checked_sub(1)?,
            c if Some(c) == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    parts.push(&s[start..]);
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::meta::VType;

    #[test]
    fn test_parse_literals() {
        assert!(parse_value("null").is_noting());
        assert_eq!(parse_value("true"), ValueItem::from(true));
        assert_eq!(parse_value("0x1f").vtype(), VType::UndefinedPtr);
        assert_eq!(parse_value(r"'\''").to_script_string().unwrap(), "'");
        assert_eq!(parse_value("\"a,b\"").to_script_string().unwrap(), "a,b");
        assert_eq!(parse_value("t(99)").vtype(), VType::TimePoint);
    }

    #[test]
    fn test_parse_numbers_in_order() {
        assert_eq!(parse_value("12").vtype(), VType::I32);
        assert_eq!(parse_value("3000000000").vtype(), VType::Ui32);
        assert_eq!(parse_value("-3000000000").vtype(), VType::I64);
        assert_eq!(parse_value("18000000000000000000").vtype(), VType::Ui64);
        assert_eq!(parse_value("1.5").vtype(), VType::Flo);
        assert_eq!(parse_value("3.141592653589793").vtype(), VType::Doub);
        assert_eq!(parse_value("hello").vtype(), VType::String);
    }

    #[test]
    fn test_parse_containers() {
        let arr = parse_value("[1,[2,3],\"x,y\"]");
        assert_eq!(arr.vtype(), VType::Uarr);
        assert_eq!(arr.len().unwrap(), 3);
        assert_eq!(arr.get(1).unwrap().len().unwrap(), 2);

        let fixed = parse_value("*[1,2]");
        assert_eq!(fixed.vtype(), VType::Faarr);

        let map = parse_value("{1:\"a\",2:[3]}");
        assert_eq!(map.vtype(), VType::Map);
        assert_eq!(map.len().unwrap(), 2);

        let set = parse_value("(1,2,2)");
        assert_eq!(set.vtype(), VType::Set);
        assert_eq!(set.len().unwrap(), 2);

        assert_eq!(parse_value("[]").len().unwrap(), 0);
        assert_eq!(parse_value("[1,2").vtype(), VType::String);
    }

    #[test]
    fn test_round_trip() {
        let arr = parse_value("[1,2,3]");
        let text = arr.to_script_string().unwrap();
        assert_eq!(text, "[1,2,3]");
        assert_eq!(parse_value(&text), arr);
    }
}
