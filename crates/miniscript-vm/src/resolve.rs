use std::rc::Rc;

use miniscript_core::{ListRc, MiniscriptError, ValMap, Value, ISA_KEY, MAX_ISA_DEPTH};

use crate::context::Context;
use crate::intrinsics;

/// The current value of a value in a context.  Data values evaluate to
/// themselves; variable references, temporaries, and sequence elements
/// resolve through the context.
pub fn value_of(value: &Value, context: &mut Context) -> Result<Value, MiniscriptError> {
    match value {
        Value::Var { name, .. } => {
            if &**name == "self" {
                Ok(context.self_value.clone())
            } else {
                context.get_var(name)
            }
        }
        Value::Temp(n) => Ok(context.get_temp(*n)),
        Value::SeqElem(_) => val_pair(value, context).map(|(v, _)| v),
        other => Ok(other.clone()),
    }
}

/// Like `value_of`, but also reports the map the value was found in,
/// which may be several steps up the `__isa` chain.  The machine uses
/// that map to bind `super` on method calls.
pub fn val_pair(
    value: &Value,
    context: &mut Context,
) -> Result<(Value, Option<Rc<ValMap>>), MiniscriptError> {
    match value {
        Value::Var { name, .. } => {
            if &**name == "self" {
                Ok((context.self_value.clone(), None))
            } else {
                context.get_var(name).map(|v| (v, None))
            }
        }
        Value::Temp(n) => Ok((context.get_temp(*n), None)),
        Value::SeqElem(se) => {
            let base_seq = match &se.sequence {
                Value::Var { name, .. } if &**name == "self" => context.self_value.clone(),
                other => other.clone(),
            };
            let idx_val = value_of(&se.index, context)?;
            if let Value::String(ident) = &idx_val {
                return resolve(&base_seq, ident, context);
            }
            // A non-string index only works on maps, and on lists and
            // strings with a numeric index.
            let base_val = value_of(&base_seq, context)?;
            match (&base_val, &idx_val) {
                (Value::Map(m), _) => match ValMap::lookup_pair(m, &idx_val) {
                    Some((v, found_in)) => Ok((v, Some(found_in))),
                    None => Err(MiniscriptError::KeyNotFound(idx_val.code_form(1, None))),
                },
                (Value::List(l), Value::Number(_)) => {
                    list_get_elem(l, &idx_val).map(|v| (v, None))
                }
                (Value::String(s), Value::Number(_)) => {
                    string_get_elem(s, &idx_val).map(|v| (v, None))
                }
                _ => Err(MiniscriptError::type_error(
                    "Type Exception: can't index into this type",
                )),
            }
        }
        other => Ok((other.clone(), None)),
    }
}

/// Indexed element of a list, with Python-style negative indices.
pub fn list_get_elem(list: &ListRc, index: &Value) -> Result<Value, MiniscriptError> {
    let values = list.borrow();
    let mut i = index.int_value();
    if i < 0 {
        i += values.len() as i64;
    }
    if i < 0 || i as usize >= values.len() {
        return Err(MiniscriptError::index(format!(
            "Index Error (list index {index} out of range)"
        )));
    }
    Ok(values[i as usize].clone())
}

/// Indexed character of a string, as a one-character string.
pub fn string_get_elem(s: &str, index: &Value) -> Result<Value, MiniscriptError> {
    let len = s.chars().count() as i64;
    let mut i = index.int_value();
    if i < 0 {
        i += len;
    }
    if i < 0 || i >= len {
        return Err(MiniscriptError::index(format!(
            "Index Error (string index {index} out of range)"
        )));
    }
    let c = s.chars().nth(i as usize).unwrap();
    Ok(Value::string(c.to_string()))
}

/// Look up an identifier in a sequence, walking the type chain: maps
/// follow `__isa` (at most 1000 hops, then key failure), and the
/// primitive types jump to their built-in prototype maps.
pub fn resolve(
    sequence: &Value,
    identifier: &str,
    context: &mut Context,
) -> Result<(Value, Option<Rc<ValMap>>), MiniscriptError> {
    let mut include_map_type = true;
    let mut loops_left = MAX_ISA_DEPTH as i64;
    let mut sequence = sequence.clone();
    loop {
        if matches!(sequence, Value::Temp(_) | Value::Var { .. }) {
            sequence = value_of(&sequence, context)?;
        }
        match &sequence {
            Value::Map(m) => {
                if let Some(result) = m.get_raw_str(identifier) {
                    return Ok((result, Some(Rc::clone(m))));
                }
                if loops_left < 0 {
                    return Err(MiniscriptError::KeyNotFound(identifier.to_string()));
                }
                match m.get_raw_str(ISA_KEY) {
                    Some(isa) => sequence = isa,
                    None => {
                        if !include_map_type {
                            return Err(MiniscriptError::KeyNotFound(identifier.to_string()));
                        }
                        sequence = Value::Map(map_type_for(context));
                        include_map_type = false;
                    }
                }
            }
            Value::List(_) => {
                sequence = Value::Map(list_type_for(context));
                include_map_type = false;
            }
            Value::String(_) => {
                sequence = Value::Map(string_type_for(context));
                include_map_type = false;
            }
            Value::Number(_) => {
                sequence = Value::Map(number_type_for(context));
                include_map_type = false;
            }
            Value::Function(_) => {
                sequence = Value::Map(function_type_for(context));
                include_map_type = false;
            }
            Value::Null => return Ok((Value::Null, None)),
            _ => {
                return Err(MiniscriptError::type_error(format!(
                    "Type Error (while attempting to look up {identifier})"
                )));
            }
        }
        loops_left -= 1;
    }
}

fn map_type_for(context: &Context) -> Rc<ValMap> {
    let cached = context.shared.borrow().map_type.clone();
    cached.unwrap_or_else(intrinsics::map_type)
}

fn list_type_for(context: &Context) -> Rc<ValMap> {
    let cached = context.shared.borrow().list_type.clone();
    cached.unwrap_or_else(intrinsics::list_type)
}

fn string_type_for(context: &Context) -> Rc<ValMap> {
    let cached = context.shared.borrow().string_type.clone();
    cached.unwrap_or_else(intrinsics::string_type)
}

fn number_type_for(context: &Context) -> Rc<ValMap> {
    let cached = context.shared.borrow().number_type.clone();
    cached.unwrap_or_else(intrinsics::number_type)
}

fn function_type_for(context: &Context) -> Rc<ValMap> {
    let cached = context.shared.borrow().function_type.clone();
    cached.unwrap_or_else(intrinsics::function_type)
}

/// Whether a value is an instance of the given type, in the context of
/// this machine's type maps.
pub fn is_a(value: &Value, type_value: &Value, context: &Context) -> bool {
    let shared = context.shared.borrow();
    let type_map = match type_value {
        Value::Map(m) => m,
        _ => return false,
    };
    let matches_type = |slot: &Option<Rc<ValMap>>| {
        slot.as_ref().is_some_and(|t| Rc::ptr_eq(t, type_map))
    };
    match value {
        Value::Number(_) => matches_type(&shared.number_type),
        Value::String(_) => matches_type(&shared.string_type),
        Value::List(_) => matches_type(&shared.list_type),
        Value::Function(_) => matches_type(&shared.function_type),
        Value::Map(m) => {
            if matches_type(&shared.map_type) {
                return true;
            }
            let mut p = m.get_raw_str(ISA_KEY);
            let mut loops_left = MAX_ISA_DEPTH;
            while let Some(parent) = p {
                match &parent {
                    Value::Map(pm) => {
                        if Rc::ptr_eq(pm, type_map) {
                            return true;
                        }
                        if loops_left == 0 {
                            return false;
                        }
                        loops_left -= 1;
                        p = pm.get_raw_str(ISA_KEY);
                    }
                    _ => return false,
                }
            }
            false
        }
        _ => false,
    }
}

/// Fully evaluate a value: like `value_of`, but resolving variable and
/// temporary references inside list and map literals.
pub fn full_eval(value: &Value, context: &mut Context) -> Result<Value, MiniscriptError> {
    match value {
        Value::List(l) => {
            // Do not mutate the original list: it may be a literal that
            // runs again.  Copy only if something actually resolves.
            let snapshot: Vec<Value> = l.borrow().clone();
            let mut result: Option<Vec<Value>> = None;
            for (i, v) in snapshot.iter().enumerate() {
                let mut copied = false;
                if matches!(v, Value::Temp(_) | Value::Var { .. }) {
                    let new_val = value_of(v, context)?;
                    if result.is_none() {
                        result = Some(snapshot[..i].to_vec());
                    }
                    result.as_mut().unwrap().push(new_val);
                    copied = true;
                }
                if !copied {
                    if let Some(r) = result.as_mut() {
                        r.push(v.clone());
                    }
                }
            }
            Ok(match result {
                Some(r) => Value::list(r),
                None => value.clone(),
            })
        }
        Value::Map(m) => {
            // Maps resolve their members in place.
            let entries = m.entries();
            for (k, v) in entries {
                let k_ref = matches!(k, Value::Temp(_) | Value::Var { .. });
                let v_ref = matches!(v, Value::Temp(_) | Value::Var { .. });
                if k_ref {
                    m.remove(&k);
                    let new_key = value_of(&k, context)?;
                    let new_val = if v_ref { value_of(&v, context)? } else { v };
                    m.insert(new_key, new_val);
                } else if v_ref {
                    m.insert(k, value_of(&v, context)?);
                }
            }
            Ok(value.clone())
        }
        other => Ok(other.clone()),
    }
}

/// Evaluated copy of a list literal, so each execution yields a fresh
/// mutable object.
pub fn eval_copy_list(list: &ListRc, context: &mut Context) -> Result<Value, MiniscriptError> {
    let snapshot: Vec<Value> = list.borrow().clone();
    let mut result = Vec::with_capacity(snapshot.len());
    for v in &snapshot {
        result.push(value_of(v, context)?);
    }
    Ok(Value::list(result))
}

/// Evaluated copy of a map literal.
pub fn eval_copy_map(map: &Rc<ValMap>, context: &mut Context) -> Result<Value, MiniscriptError> {
    let result = ValMap::new();
    for (k, v) in map.entries() {
        let key = match &k {
            Value::Temp(_) | Value::Var { .. } => value_of(&k, context)?,
            _ => k,
        };
        let val = match &v {
            Value::Temp(_) | Value::Var { .. } => value_of(&v, context)?,
            _ => v,
        };
        result.insert(key, val);
    }
    Ok(Value::Map(Rc::new(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineShared;
    use miniscript_core::new_code;

    fn test_context() -> Context {
        Context::root(new_code(), MachineShared::new_rc(None))
    }

    #[test]
    fn vars_and_temps_resolve() {
        let mut ctx = test_context();
        ctx.set_var("x", Value::Number(3.0)).unwrap();
        ctx.set_temp(2, Value::string("t"));
        assert_eq!(value_of(&Value::var("x"), &mut ctx).unwrap().double_value(), 3.0);
        assert_eq!(
            value_of(&Value::temp(2), &mut ctx).unwrap().as_string().unwrap(),
            "t"
        );
    }

    #[test]
    fn seq_elem_walks_isa_chain() {
        let mut ctx = test_context();
        let parent = ValMap::new_rc();
        parent.set("kind", Value::string("base"));
        let child = ValMap::new_rc();
        child.set(ISA_KEY, Value::Map(Rc::clone(&parent)));
        ctx.set_var("c", Value::Map(child)).unwrap();

        let elem = Value::seq_elem(Value::var("c"), Value::string("kind"));
        let (found, found_in) = val_pair(&elem, &mut ctx).unwrap();
        assert_eq!(found.as_string().unwrap(), "base");
        assert!(Rc::ptr_eq(&found_in.unwrap(), &parent));
    }

    #[test]
    fn missing_key_is_key_error() {
        let mut ctx = test_context();
        ctx.set_var("m", Value::new_map()).unwrap();
        let elem = Value::seq_elem(Value::var("m"), Value::string("nope"));
        assert!(matches!(
            value_of(&elem, &mut ctx),
            Err(MiniscriptError::KeyNotFound(_))
        ));
    }

    #[test]
    fn isa_chain_too_deep_is_key_error() {
        let mut ctx = test_context();
        let mut top = ValMap::new_rc();
        for _ in 0..1100 {
            let next = ValMap::new_rc();
            next.set(ISA_KEY, Value::Map(Rc::clone(&top)));
            top = next;
        }
        let result = resolve(&Value::Map(top), "missing", &mut ctx);
        assert!(matches!(result, Err(MiniscriptError::KeyNotFound(_))));
    }

    #[test]
    fn string_members_come_from_string_type() {
        let mut ctx = test_context();
        let (found, _) = resolve(&Value::string("hi"), "len", &mut ctx).unwrap();
        assert!(found.as_function().is_some());
    }

    #[test]
    fn negative_indices_count_from_end() {
        let list = match Value::list(vec![Value::Number(1.0), Value::Number(2.0)]) {
            Value::List(l) => l,
            _ => unreachable!(),
        };
        assert_eq!(
            list_get_elem(&list, &Value::Number(-1.0)).unwrap().double_value(),
            2.0
        );
        assert!(list_get_elem(&list, &Value::Number(2.0)).is_err());
        assert_eq!(
            string_get_elem("abc", &Value::Number(-3.0)).unwrap().as_string().unwrap(),
            "a"
        );
    }

    #[test]
    fn eval_copy_produces_fresh_lists() {
        let mut ctx = test_context();
        ctx.set_var("x", Value::Number(9.0)).unwrap();
        let literal = match Value::list(vec![Value::var("x"), Value::Number(1.0)]) {
            Value::List(l) => l,
            _ => unreachable!(),
        };
        let copy1 = eval_copy_list(&literal, &mut ctx).unwrap();
        let copy2 = eval_copy_list(&literal, &mut ctx).unwrap();
        assert_eq!(copy1.as_list().unwrap().borrow()[0].double_value(), 9.0);
        assert!(!Rc::ptr_eq(copy1.as_list().unwrap(), copy2.as_list().unwrap()));
        // the literal itself still holds the unresolved reference
        assert!(matches!(literal.borrow()[0], Value::Var { .. }));
    }
}
