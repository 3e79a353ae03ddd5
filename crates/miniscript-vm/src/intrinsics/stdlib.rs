//! The standard MiniScript intrinsics.  Registration order fixes the
//! numeric ids, so new intrinsics belong at the end.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use miniscript_core::{MiniscriptError, ValMap, Value, MAX_LIST_SIZE};

use crate::context::Context;
use crate::intrinsics::{host_info, Intrinsic, IntrinsicResult};
use crate::resolve::eval_copy_map;

thread_local! {
    static RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    RNG.with(|r| {
        let mut slot = r.borrow_mut();
        let rng = slot.get_or_insert_with(StdRng::from_entropy);
        f(rng)
    })
}

fn reseed(seed: u64) {
    RNG.with(|r| *r.borrow_mut() = Some(StdRng::seed_from_u64(seed)));
}

fn local(ctx: &Context, name: &str) -> Value {
    ctx.get_local(name).unwrap_or(Value::Null)
}

/// Naive substring search over chars (MiniScript indexes characters,
/// not bytes).
fn chars_index_of(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return if from <= haystack.len() {
            Some(from)
        } else {
            None
        };
    }
    if needle.len() > haystack.len() || from + needle.len() > haystack.len() {
        return None;
    }
    for i in from..=(haystack.len() - needle.len()) {
        if haystack[i..i + needle.len()] == *needle {
            return Some(i);
        }
    }
    None
}

/// Ordering for sort: nulls last, strings lexicographically, numbers
/// numerically, everything else equal.
fn compare_values(x: &Value, y: &Value) -> Ordering {
    match (x.is_null(), y.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => {
            if matches!(x, Value::String(_)) || matches!(y, Value::String(_)) {
                x.to_display().cmp(&y.to_display())
            } else if let (Value::Number(a), Value::Number(b)) = (x, y) {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            } else {
                Ordering::Equal
            }
        }
    }
}

fn directed(ord: Ordering, ascending: bool) -> Ordering {
    if ascending {
        ord
    } else {
        ord.reverse()
    }
}

fn copy_type_map(
    proto: &Rc<ValMap>,
    ctx: &mut Context,
) -> Result<Rc<ValMap>, MiniscriptError> {
    match eval_copy_map(proto, ctx)? {
        Value::Map(m) => Ok(m),
        _ => Err(MiniscriptError::runtime("type map copy failed")),
    }
}

pub(super) fn init() {
    // abs(x): absolute value.
    Intrinsic::create("abs").add_param_num("x", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("x", 0.0).abs()))
    });

    Intrinsic::create("acos").add_param_num("x", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("x", 0.0).acos()))
    });

    Intrinsic::create("asin").add_param_num("x", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("x", 0.0).asin()))
    });

    // atan(y, x=1): arctangent of y/x, in the correct quadrant.  Note
    // the y,x parameter order.
    Intrinsic::create("atan")
        .add_param_num("y", 0.0)
        .add_param_num("x", 1.0)
        .code(|ctx, _| {
            let y = ctx.get_local_f64("y", 0.0);
            let x = ctx.get_local_f64("x", 1.0);
            if x == 1.0 {
                Ok(IntrinsicResult::num(y.atan()))
            } else {
                Ok(IntrinsicResult::num(y.atan2(x)))
            }
        });

    Intrinsic::create("bitAnd")
        .add_param_num("i", 0.0)
        .add_param_num("j", 0.0)
        .code(|ctx, _| {
            let i = ctx.get_local_int("i", 0);
            let j = ctx.get_local_int("j", 0);
            Ok(IntrinsicResult::num((i & j) as f64))
        });

    Intrinsic::create("bitOr")
        .add_param_num("i", 0.0)
        .add_param_num("j", 0.0)
        .code(|ctx, _| {
            let i = ctx.get_local_int("i", 0);
            let j = ctx.get_local_int("j", 0);
            Ok(IntrinsicResult::num((i | j) as f64))
        });

    Intrinsic::create("bitXor")
        .add_param_num("i", 0.0)
        .add_param_num("j", 0.0)
        .code(|ctx, _| {
            let i = ctx.get_local_int("i", 0);
            let j = ctx.get_local_int("j", 0);
            Ok(IntrinsicResult::num((i ^ j) as f64))
        });

    // char(codePoint=65): string containing the given code point.
    Intrinsic::create("char")
        .add_param_num("codePoint", 65.0)
        .code(|ctx, _| {
            let cp = ctx.get_local_int("codePoint", 65);
            let c = u32::try_from(cp)
                .ok()
                .and_then(char::from_u32)
                .unwrap_or('?');
            Ok(IntrinsicResult::string(c.to_string()))
        });

    Intrinsic::create("ceil").add_param_num("x", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("x", 0.0).ceil()))
    });

    // code: code point of the first character of self.
    Intrinsic::create("code").add_param("self").code(|ctx, _| {
        let cp = ctx
            .self_value
            .to_display()
            .chars()
            .next()
            .map(|c| c as u32)
            .unwrap_or(0);
        Ok(IntrinsicResult::num(cp as f64))
    });

    Intrinsic::create("cos").add_param_num("radians", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("radians", 0.0).cos()))
    });

    Intrinsic::create("floor").add_param_num("x", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("x", 0.0).floor()))
    });

    // funcRef: the map representing the function type.
    Intrinsic::create("funcRef").code(|ctx, _| {
        let cached = ctx.shared.borrow().function_type.clone();
        let map = match cached {
            Some(m) => m,
            None => {
                let copy = copy_type_map(&super::function_type(), ctx)?;
                ctx.shared.borrow_mut().function_type = Some(Rc::clone(&copy));
                copy
            }
        };
        Ok(IntrinsicResult::new(Value::Map(map)))
    });

    // hash(obj): an integer "relatively unique" to the given value.
    Intrinsic::create("hash").add_param("obj").code(|ctx, _| {
        Ok(IntrinsicResult::num(local(ctx, "obj").hash() as f64))
    });

    // hasIndex(self, index): whether self[index] would be valid.
    Intrinsic::create("hasIndex")
        .add_param("self")
        .add_param("index")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let index = local(ctx, "index");
            match &self_val {
                Value::List(l) => {
                    if !matches!(index, Value::Number(_)) {
                        return Ok(IntrinsicResult::truth(false));
                    }
                    let len = l.borrow().len() as i64;
                    let i = index.int_value();
                    Ok(IntrinsicResult::truth(i >= -len && i < len))
                }
                Value::String(s) => {
                    let len = s.chars().count() as i64;
                    let i = index.int_value();
                    Ok(IntrinsicResult::truth(i >= -len && i < len))
                }
                Value::Map(m) => Ok(IntrinsicResult::truth(m.contains_key(&index))),
                _ => Ok(IntrinsicResult::null()),
            }
        });

    // indexes(self): keys of a map, or 0..len for strings and lists.
    Intrinsic::create("indexes").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::Map(m) => Ok(IntrinsicResult::new(Value::list(m.keys()))),
            Value::String(s) => {
                let indexes = (0..s.chars().count())
                    .map(|i| Value::Number(i as f64))
                    .collect();
                Ok(IntrinsicResult::new(Value::list(indexes)))
            }
            Value::List(l) => {
                let indexes = (0..l.borrow().len())
                    .map(|i| Value::Number(i as f64))
                    .collect();
                Ok(IntrinsicResult::new(Value::list(indexes)))
            }
            _ => Ok(IntrinsicResult::null()),
        }
    });

    // indexOf(self, value, after): first index (after `after`) where
    // self[index] == value, or null.
    Intrinsic::create("indexOf")
        .add_param("self")
        .add_param("value")
        .add_param("after")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let value = local(ctx, "value");
            let after = local(ctx, "after");
            match &self_val {
                Value::List(l) => {
                    let items: Vec<Value> = l.borrow().clone();
                    let len = items.len() as i64;
                    let start = if after.is_null() {
                        0
                    } else {
                        let mut after_idx = after.int_value();
                        if after_idx < -1 {
                            after_idx += len;
                        }
                        if after_idx < -1 || after_idx >= len - 1 {
                            return Ok(IntrinsicResult::null());
                        }
                        after_idx + 1
                    };
                    for (i, item) in items.iter().enumerate().skip(start as usize) {
                        if item.equality(&value, 16) == 1.0 {
                            return Ok(IntrinsicResult::num(i as f64));
                        }
                    }
                    Ok(IntrinsicResult::null())
                }
                Value::String(s) => {
                    if value.is_null() {
                        return Ok(IntrinsicResult::null());
                    }
                    let haystack: Vec<char> = s.chars().collect();
                    let needle: Vec<char> = value.to_display().chars().collect();
                    let len = haystack.len() as i64;
                    let start = if after.is_null() {
                        0
                    } else {
                        let mut after_idx = after.int_value();
                        if after_idx < -1 {
                            after_idx += len;
                        }
                        if after_idx < -1 || after_idx >= len - 1 {
                            return Ok(IntrinsicResult::null());
                        }
                        after_idx + 1
                    };
                    match chars_index_of(&haystack, &needle, start as usize) {
                        Some(i) => Ok(IntrinsicResult::num(i as f64)),
                        None => Ok(IntrinsicResult::null()),
                    }
                }
                Value::Map(m) => {
                    let mut saw_after = after.is_null();
                    for (k, v) in m.entries() {
                        if !saw_after {
                            if k.equality(&after, 16) == 1.0 {
                                saw_after = true;
                            }
                        } else if v.equality(&value, 16) == 1.0 {
                            return Ok(IntrinsicResult::new(k));
                        }
                    }
                    Ok(IntrinsicResult::null())
                }
                _ => Ok(IntrinsicResult::null()),
            }
        });

    // insert(self, index, value): insert into a list (in place) or a
    // string (returning a new string).
    Intrinsic::create("insert")
        .add_param("self")
        .add_param("index")
        .add_param("value")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let index = local(ctx, "index");
            let value = local(ctx, "value");
            if index.is_null() {
                return Err(MiniscriptError::runtime("insert: index argument required"));
            }
            if !matches!(index, Value::Number(_)) {
                return Err(MiniscriptError::runtime(
                    "insert: number required for index argument",
                ));
            }
            let mut idx = index.int_value();
            match &self_val {
                Value::List(l) => {
                    let mut items = l.borrow_mut();
                    if idx < 0 {
                        // counting from the end, and inserting
                        idx += items.len() as i64 + 1;
                    }
                    MiniscriptError::check_range(idx, 0, items.len() as i64, "index")?;
                    items.insert(idx as usize, value);
                    drop(items);
                    Ok(IntrinsicResult::new(self_val))
                }
                Value::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    if idx < 0 {
                        idx += chars.len() as i64 + 1;
                    }
                    MiniscriptError::check_range(idx, 0, chars.len() as i64, "index")?;
                    let mut result: String = chars[..idx as usize].iter().collect();
                    result.push_str(&value.to_display());
                    result.extend(chars[idx as usize..].iter());
                    Ok(IntrinsicResult::string(result))
                }
                _ => Err(MiniscriptError::runtime("insert called on invalid type")),
            }
        });

    // join(self, delimiter=" "): string built from a list's elements.
    Intrinsic::create("join")
        .add_param("self")
        .add_param_str("delimiter", " ")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let delim = ctx.get_local_string("delimiter", " ");
            let list = match &self_val {
                Value::List(l) => l,
                _ => return Ok(IntrinsicResult::new(self_val)),
            };
            let parts: Vec<String> = list.borrow().iter().map(|v| v.to_display()).collect();
            Ok(IntrinsicResult::string(parts.join(&delim)))
        });

    // len(self): characters, elements, or key/value pairs.
    Intrinsic::create("len").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::List(l) => Ok(IntrinsicResult::num(l.borrow().len() as f64)),
            Value::String(s) => Ok(IntrinsicResult::num(s.chars().count() as f64)),
            Value::Map(m) => Ok(IntrinsicResult::num(m.count() as f64)),
            _ => Ok(IntrinsicResult::null()),
        }
    });

    // list: the map representing the list type (methods live here).
    Intrinsic::create("list").code(|ctx, _| {
        let cached = ctx.shared.borrow().list_type.clone();
        let map = match cached {
            Some(m) => m,
            None => {
                let copy = copy_type_map(&super::list_type(), ctx)?;
                ctx.shared.borrow_mut().list_type = Some(Rc::clone(&copy));
                copy
            }
        };
        Ok(IntrinsicResult::new(Value::Map(map)))
    });

    // log(x, base=10)
    Intrinsic::create("log")
        .add_param_num("x", 0.0)
        .add_param_num("base", 10.0)
        .code(|ctx, _| {
            let x = ctx.get_local_f64("x", 0.0);
            let b = ctx.get_local_f64("base", 10.0);
            let result = if (b - std::f64::consts::E).abs() < 0.000001 {
                x.ln()
            } else {
                x.ln() / b.ln()
            };
            Ok(IntrinsicResult::num(result))
        });

    Intrinsic::create("lower").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::String(s) => Ok(IntrinsicResult::string(s.to_lowercase())),
            _ => Ok(IntrinsicResult::new(self_val)),
        }
    });

    // map: the map representing the map type.
    Intrinsic::create("map").code(|ctx, _| {
        let cached = ctx.shared.borrow().map_type.clone();
        let map = match cached {
            Some(m) => m,
            None => {
                let copy = copy_type_map(&super::map_type(), ctx)?;
                ctx.shared.borrow_mut().map_type = Some(Rc::clone(&copy));
                copy
            }
        };
        Ok(IntrinsicResult::new(Value::Map(map)))
    });

    // number: the map representing the number type.
    Intrinsic::create("number").code(|ctx, _| {
        let cached = ctx.shared.borrow().number_type.clone();
        let map = match cached {
            Some(m) => m,
            None => {
                let copy = copy_type_map(&super::number_type(), ctx)?;
                ctx.shared.borrow_mut().number_type = Some(Rc::clone(&copy));
                copy
            }
        };
        Ok(IntrinsicResult::new(Value::Map(map)))
    });

    Intrinsic::create("pi").code(|_ctx, _| Ok(IntrinsicResult::num(std::f64::consts::PI)));

    // print(s=""): write to the standard output sink.
    Intrinsic::create("print").add_param_str("s", "").code(|ctx, _| {
        let text = match ctx.get_local("s") {
            Some(Value::Null) | None => "null".to_string(),
            Some(v) => v.to_display(),
        };
        let out = ctx.shared.borrow().standard_output.clone();
        out(&text);
        Ok(IntrinsicResult::null())
    });

    // pop(self): remove and return the last list item, or the first map
    // key.
    Intrinsic::create("pop").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::List(l) => match l.borrow_mut().pop() {
                Some(v) => Ok(IntrinsicResult::new(v)),
                None => Ok(IntrinsicResult::null()),
            },
            Value::Map(m) => match m.borrow_mut().shift_remove_index(0) {
                Some((k, _)) => Ok(IntrinsicResult::new(k.into_value())),
                None => Ok(IntrinsicResult::null()),
            },
            _ => Ok(IntrinsicResult::null()),
        }
    });

    // pull(self): remove and return the first list item, or the first
    // map key.
    Intrinsic::create("pull").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::List(l) => {
                let mut items = l.borrow_mut();
                if items.is_empty() {
                    return Ok(IntrinsicResult::null());
                }
                Ok(IntrinsicResult::new(items.remove(0)))
            }
            Value::Map(m) => match m.borrow_mut().shift_remove_index(0) {
                Some((k, _)) => Ok(IntrinsicResult::new(k.into_value())),
                None => Ok(IntrinsicResult::null()),
            },
            _ => Ok(IntrinsicResult::null()),
        }
    });

    // push(self, value): append to a list, or set map[value] = 1.
    Intrinsic::create("push")
        .add_param("self")
        .add_param("value")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let value = local(ctx, "value");
            match &self_val {
                Value::List(l) => {
                    l.borrow_mut().push(value);
                    Ok(IntrinsicResult::new(self_val))
                }
                Value::Map(m) => {
                    m.insert(value, Value::ONE);
                    Ok(IntrinsicResult::new(self_val))
                }
                _ => Ok(IntrinsicResult::null()),
            }
        });

    // range(from=0, to=0, step): a list of numbers.
    Intrinsic::create("range")
        .add_param_num("from", 0.0)
        .add_param_num("to", 0.0)
        .add_param("step")
        .code(|ctx, _| {
            let from = ctx.get_local_f64("from", 0.0);
            let to = ctx.get_local_f64("to", 0.0);
            let mut step = if to >= from { 1.0 } else { -1.0 };
            if let Some(Value::Number(s)) = ctx.get_local("step") {
                step = s;
            }
            if step == 0.0 {
                return Err(MiniscriptError::runtime("range() error (step==0)"));
            }
            let count = ((to - from) / step) as i64 + 1;
            if count > MAX_LIST_SIZE as i64 {
                return Err(MiniscriptError::limit("list too large"));
            }
            let mut values = Vec::with_capacity(count.max(0) as usize);
            let mut v = from;
            while if step > 0.0 { v <= to } else { v >= to } {
                values.push(Value::Number(v));
                v += step;
            }
            Ok(IntrinsicResult::new(Value::list(values)))
        });

    // remove(self, k): list by index (in place), map by key (in place,
    // returning 1/0), or string (returning a new string).
    Intrinsic::create("remove")
        .add_param("self")
        .add_param("k")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let k = local(ctx, "k");
            match &self_val {
                Value::Map(m) => Ok(IntrinsicResult::truth(m.remove(&k))),
                Value::List(l) => {
                    if k.is_null() {
                        return Err(MiniscriptError::runtime(
                            "argument to 'remove' must not be null",
                        ));
                    }
                    let mut items = l.borrow_mut();
                    let mut idx = k.int_value();
                    if idx < 0 {
                        idx += items.len() as i64;
                    }
                    MiniscriptError::check_range(idx, 0, items.len() as i64 - 1, "index")?;
                    items.remove(idx as usize);
                    Ok(IntrinsicResult::null())
                }
                Value::String(s) => {
                    if k.is_null() {
                        return Err(MiniscriptError::runtime(
                            "argument to 'remove' must not be null",
                        ));
                    }
                    let substr = k.to_display();
                    match s.find(&substr) {
                        Some(at) => {
                            let result = format!("{}{}", &s[..at], &s[at + substr.len()..]);
                            Ok(IntrinsicResult::string(result))
                        }
                        None => Ok(IntrinsicResult::new(self_val)),
                    }
                }
                _ => Err(MiniscriptError::type_error(
                    "Type Error: 'remove' requires map, list, or string",
                )),
            }
        });

    // replace(self, oldval, newval, maxCount): lists and maps mutate in
    // place (values, not keys); strings return a new string.
    Intrinsic::create("replace")
        .add_param("self")
        .add_param("oldval")
        .add_param("newval")
        .add_param("maxCount")
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            if self_val.is_null() {
                return Err(MiniscriptError::runtime(
                    "argument to 'replace' must not be null",
                ));
            }
            let oldval = local(ctx, "oldval");
            let newval = local(ctx, "newval");
            let max_count = match ctx.get_local("maxCount") {
                Some(Value::Null) | None => -1,
                Some(v) => {
                    let mc = v.int_value();
                    if mc < 1 {
                        return Ok(IntrinsicResult::new(self_val));
                    }
                    mc
                }
            };
            let mut count = 0i64;
            match &self_val {
                Value::Map(m) => {
                    let mut keys_to_change = Vec::new();
                    for (k, v) in m.entries() {
                        if v.equality(&oldval, 16) == 1.0 {
                            keys_to_change.push(k);
                            count += 1;
                            if max_count > 0 && count == max_count {
                                break;
                            }
                        }
                    }
                    for k in keys_to_change {
                        m.insert(k, newval.clone());
                    }
                    Ok(IntrinsicResult::new(self_val))
                }
                Value::List(l) => {
                    let mut items = l.borrow_mut();
                    for item in items.iter_mut() {
                        if item.equality(&oldval, 16) == 1.0 {
                            *item = newval.clone();
                            count += 1;
                            if max_count > 0 && count == max_count {
                                break;
                            }
                        }
                    }
                    drop(items);
                    Ok(IntrinsicResult::new(self_val))
                }
                Value::String(_) => {
                    let mut s = self_val.to_display();
                    let oldstr = if oldval.is_null() {
                        String::new()
                    } else {
                        oldval.to_display()
                    };
                    if oldstr.is_empty() {
                        return Err(MiniscriptError::runtime(
                            "replace: oldval argument is empty",
                        ));
                    }
                    let newstr = if newval.is_null() {
                        String::new()
                    } else {
                        newval.to_display()
                    };
                    let mut idx = 0;
                    loop {
                        match s[idx..].find(&oldstr) {
                            None => break,
                            Some(rel) => {
                                let at = idx + rel;
                                s = format!("{}{}{}", &s[..at], newstr, &s[at + oldstr.len()..]);
                                idx = at + newstr.len();
                                count += 1;
                                if max_count > 0 && count == max_count {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(IntrinsicResult::string(s))
                }
                _ => Err(MiniscriptError::type_error(
                    "Type Error: 'replace' requires map, list, or string",
                )),
            }
        });

    // round(x, decimalPlaces=0): negative places round to powers of 10.
    Intrinsic::create("round")
        .add_param_num("x", 0.0)
        .add_param_num("decimalPlaces", 0.0)
        .code(|ctx, _| {
            let num = ctx.get_local_f64("x", 0.0);
            let places = ctx.get_local_int("decimalPlaces", 0);
            let result = if places >= 0 {
                let places = places.min(15);
                let factor = 10f64.powi(places as i32);
                (num * factor).round() / factor
            } else {
                let pow10 = 10f64.powi((-places) as i32);
                (num / pow10).round() * pow10
            };
            Ok(IntrinsicResult::num(result))
        });

    // rnd(seed): pseudorandom number in [0,1); a seed resets the
    // sequence for repeatable runs.
    Intrinsic::create("rnd").add_param("seed").code(|ctx, _| {
        if let Some(seed) = ctx.get_local("seed") {
            if !seed.is_null() {
                reseed(seed.int_value() as u64);
            }
        }
        Ok(IntrinsicResult::num(with_rng(|r| r.gen::<f64>())))
    });

    Intrinsic::create("sign").add_param_num("x", 0.0).code(|ctx, _| {
        let x = ctx.get_local_f64("x", 0.0);
        let s = if x > 0.0 {
            1.0
        } else if x < 0.0 {
            -1.0
        } else {
            0.0
        };
        Ok(IntrinsicResult::num(s))
    });

    Intrinsic::create("sin").add_param_num("radians", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("radians", 0.0).sin()))
    });

    // slice(seq, from=0, to): subsequence; the [a:b] operator compiles
    // to a call to this.
    Intrinsic::create("slice")
        .add_param("seq")
        .add_param_num("from", 0.0)
        .add_param("to")
        .code(|ctx, _| {
            let seq = local(ctx, "seq");
            let mut from_idx = ctx.get_local_int("from", 0);
            let to_val = match ctx.get_local("to") {
                Some(Value::Null) | None => None,
                Some(v) => Some(v),
            };
            match &seq {
                Value::List(l) => {
                    let items = l.borrow();
                    let len = items.len() as i64;
                    if from_idx < 0 {
                        from_idx += len;
                    }
                    if from_idx < 0 {
                        from_idx = 0;
                    }
                    let mut to_idx = match &to_val {
                        None => len,
                        Some(v) => v.int_value(),
                    };
                    if to_idx < 0 {
                        to_idx += len;
                    }
                    if to_idx > len {
                        to_idx = len;
                    }
                    let mut result = Vec::new();
                    if from_idx < len && to_idx > from_idx {
                        for i in from_idx..to_idx {
                            result.push(items[i as usize].clone());
                        }
                    }
                    Ok(IntrinsicResult::new(Value::list(result)))
                }
                Value::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let len = chars.len() as i64;
                    if from_idx < 0 {
                        from_idx += len;
                    }
                    if from_idx < 0 {
                        from_idx = 0;
                    }
                    let mut to_idx = match &to_val {
                        None => len,
                        Some(v) => v.int_value(),
                    };
                    if to_idx < 0 {
                        to_idx += len;
                    }
                    if to_idx > len {
                        to_idx = len;
                    }
                    if to_idx - from_idx <= 0 {
                        return Ok(IntrinsicResult::empty_string());
                    }
                    let result: String =
                        chars[from_idx as usize..to_idx as usize].iter().collect();
                    Ok(IntrinsicResult::string(result))
                }
                _ => Ok(IntrinsicResult::null()),
            }
        });

    // sort(self, byKey, ascending=1): sort a list in place.  With byKey,
    // elements are decorated with self[byKey] and sorted by that.
    Intrinsic::create("sort")
        .add_param("self")
        .add_param("byKey")
        .add_param_num("ascending", 1.0)
        .code(|ctx, _| {
            let self_val = ctx.self_value.clone();
            let list = match &self_val {
                Value::List(l) => Rc::clone(l),
                _ => return Ok(IntrinsicResult::new(self_val)),
            };
            if list.borrow().len() < 2 {
                return Ok(IntrinsicResult::new(self_val));
            }
            let ascending = ctx.get_local_bool("ascending", true);
            let by_key = match ctx.get_local("byKey") {
                Some(Value::Null) | None => None,
                Some(k) => Some(k),
            };
            let mut items: Vec<Value> = list.borrow().clone();
            match by_key {
                None => items.sort_by(|a, b| directed(compare_values(a, b), ascending)),
                Some(key) => {
                    // Decorate with {value, sortKey}, sort on the key,
                    // and write the values back in place.
                    let key_int = key.int_value();
                    let mut keyed: Vec<(Value, Value)> = items
                        .iter()
                        .map(|item| {
                            let sort_key = match item {
                                Value::Map(m) => m.lookup(&key).unwrap_or(Value::Null),
                                Value::List(l) => {
                                    let inner = l.borrow();
                                    let len = inner.len() as i64;
                                    let mut i = key_int;
                                    if i < 0 {
                                        i += len;
                                    }
                                    if i >= 0 && i < len {
                                        inner[i as usize].clone()
                                    } else {
                                        Value::Null
                                    }
                                }
                                _ => Value::Null,
                            };
                            (item.clone(), sort_key)
                        })
                        .collect();
                    keyed.sort_by(|a, b| directed(compare_values(&a.1, &b.1), ascending));
                    items = keyed.into_iter().map(|(v, _)| v).collect();
                }
            }
            *list.borrow_mut() = items;
            Ok(IntrinsicResult::new(self_val))
        });

    // split(self, delimiter=" ", maxCount=-1)
    Intrinsic::create("split")
        .add_param("self")
        .add_param_str("delimiter", " ")
        .add_param_num("maxCount", -1.0)
        .code(|ctx, _| {
            let self_str = ctx.self_value.to_display();
            let delim = ctx.get_local_string("delimiter", " ");
            let max_count = ctx.get_local_int("maxCount", -1);
            let chars: Vec<char> = self_str.chars().collect();
            let dchars: Vec<char> = delim.chars().collect();
            let mut result: Vec<Value> = Vec::new();
            let mut pos = 0usize;
            while pos < chars.len() {
                let next_pos = if max_count >= 0 && result.len() as i64 == max_count - 1 {
                    chars.len()
                } else if dchars.is_empty() {
                    pos + 1
                } else {
                    chars_index_of(&chars, &dchars, pos).unwrap_or(chars.len())
                };
                result.push(Value::string(
                    chars[pos..next_pos].iter().collect::<String>(),
                ));
                pos = next_pos + dchars.len();
                if pos == chars.len() && !dchars.is_empty() {
                    result.push(Value::empty_string());
                }
            }
            Ok(IntrinsicResult::new(Value::list(result)))
        });

    Intrinsic::create("sqrt").add_param_num("x", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("x", 0.0).sqrt()))
    });

    // str(x): any value as a string.
    Intrinsic::create("str").add_param_str("x", "").code(|ctx, _| {
        match ctx.get_local("x") {
            Some(Value::Null) | None => Ok(IntrinsicResult::empty_string()),
            Some(v) => Ok(IntrinsicResult::string(v.to_display())),
        }
    });

    // string: the map representing the string type.
    Intrinsic::create("string").code(|ctx, _| {
        let cached = ctx.shared.borrow().string_type.clone();
        let map = match cached {
            Some(m) => m,
            None => {
                let copy = copy_type_map(&super::string_type(), ctx)?;
                ctx.shared.borrow_mut().string_type = Some(Rc::clone(&copy));
                copy
            }
        };
        Ok(IntrinsicResult::new(Value::Map(map)))
    });

    // shuffle(self): Fisher-Yates, in place.  For maps, the values get
    // shuffled among the keys.
    Intrinsic::create("shuffle").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::List(l) => {
                let mut items = l.borrow_mut();
                for i in (1..items.len()).rev() {
                    let j = with_rng(|r| r.gen_range(0..=i));
                    items.swap(i, j);
                }
            }
            Value::Map(m) => {
                let keys = m.keys();
                for i in (1..keys.len()).rev() {
                    let j = with_rng(|r| r.gen_range(0..=i));
                    let vi = m.get_raw(&keys[i]).unwrap_or(Value::Null);
                    let vj = m.get_raw(&keys[j]).unwrap_or(Value::Null);
                    m.insert(keys[i].clone(), vj);
                    m.insert(keys[j].clone(), vi);
                }
            }
            _ => {}
        }
        Ok(IntrinsicResult::null())
    });

    // sum(self): total of a list's elements or a map's values.
    Intrinsic::create("sum").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        let sum: f64 = match &self_val {
            Value::List(l) => l.borrow().iter().map(|v| v.double_value()).sum(),
            Value::Map(m) => m.values().iter().map(|v| v.double_value()).sum(),
            _ => 0.0,
        };
        Ok(IntrinsicResult::num(sum))
    });

    Intrinsic::create("tan").add_param_num("radians", 0.0).code(|ctx, _| {
        Ok(IntrinsicResult::num(ctx.get_local_f64("radians", 0.0).tan()))
    });

    // time: seconds since the script started running.
    Intrinsic::create("time").code(|ctx, _| {
        let t = ctx.shared.borrow().run_time();
        Ok(IntrinsicResult::num(t))
    });

    Intrinsic::create("upper").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::String(s) => Ok(IntrinsicResult::string(s.to_uppercase())),
            _ => Ok(IntrinsicResult::new(self_val)),
        }
    });

    // val(self): numeric value of a string.
    Intrinsic::create("val").add_param_num("self", 0.0).code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::Number(_) => Ok(IntrinsicResult::new(self_val)),
            Value::String(s) => {
                let n: f64 = s.trim().parse().unwrap_or(0.0);
                Ok(IntrinsicResult::num(n))
            }
            _ => Ok(IntrinsicResult::null()),
        }
    });

    // values(self): a map's values, or a string's characters.
    Intrinsic::create("values").add_param("self").code(|ctx, _| {
        let self_val = ctx.self_value.clone();
        match &self_val {
            Value::Map(m) => Ok(IntrinsicResult::new(Value::list(m.values()))),
            Value::String(s) => {
                let chars = s.chars().map(|c| Value::string(c.to_string())).collect();
                Ok(IntrinsicResult::new(Value::list(chars)))
            }
            _ => Ok(IntrinsicResult::new(self_val)),
        }
    });

    // version: information about the runtime and its host.
    Intrinsic::create("version").code(|ctx, _| {
        let cached = ctx.shared.borrow().version_map.clone();
        if let Some(v) = cached {
            return Ok(IntrinsicResult::new(v));
        }
        let host = host_info();
        let d = ValMap::new_rc();
        d.set("miniscript", Value::string("1.5.1"));
        d.set("buildDate", Value::string("2022-02-06"));
        d.set("host", Value::Number(host.version));
        d.set("hostName", Value::string(host.name));
        d.set("hostInfo", Value::string(host.info));
        let v = Value::Map(d);
        ctx.shared.borrow_mut().version_map = Some(v.clone());
        Ok(IntrinsicResult::new(v))
    });

    // wait(seconds=1): suspend via the partial-result protocol; the
    // machine re-invokes us each step until the end time passes.
    Intrinsic::create("wait")
        .add_param_num("seconds", 1.0)
        .code(|ctx, partial| {
            let now = ctx.shared.borrow().run_time();
            match partial {
                None => {
                    let interval = ctx.get_local_f64("seconds", 1.0);
                    Ok(IntrinsicResult::partial(Value::Number(now + interval)))
                }
                Some(p) => {
                    if now > p.value.double_value() {
                        Ok(IntrinsicResult::null())
                    } else {
                        Ok(p)
                    }
                }
            }
        });

    // yield: give the host a turn at the next step boundary.
    Intrinsic::create("yield").code(|ctx, _| {
        ctx.shared.borrow_mut().yielding = true;
        Ok(IntrinsicResult::null())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chars_index_of_basics() {
        let hay: Vec<char> = "hello world".chars().collect();
        let needle: Vec<char> = "o".chars().collect();
        assert_eq!(chars_index_of(&hay, &needle, 0), Some(4));
        assert_eq!(chars_index_of(&hay, &needle, 5), Some(7));
        assert_eq!(chars_index_of(&hay, &needle, 8), None);
        let whole: Vec<char> = "hello world".chars().collect();
        assert_eq!(chars_index_of(&hay, &whole, 0), Some(0));
        assert_eq!(chars_index_of(&hay, &whole, 1), None);
    }

    #[test]
    fn compare_values_orders_nulls_last() {
        assert_eq!(
            compare_values(&Value::Null, &Value::Number(1.0)),
            Ordering::Greater
        );
        assert_eq!(
            compare_values(&Value::Number(1.0), &Value::Null),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Number(2.0), &Value::Number(10.0)),
            Ordering::Less
        );
        // either side a string forces string comparison
        assert_eq!(
            compare_values(&Value::string("10"), &Value::Number(2.0)),
            Ordering::Less
        );
    }
}
