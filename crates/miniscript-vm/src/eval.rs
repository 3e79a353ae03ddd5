use std::rc::Rc;

use miniscript_core::{
    Line, MiniscriptError, Op, ValMap, Value, MAX_LIST_SIZE, MAX_STRING_SIZE,
};

use crate::context::Context;
use crate::intrinsics::Intrinsic;
use crate::machine::find_short_name_in;
use crate::resolve::{
    eval_copy_list, eval_copy_map, full_eval, is_a, list_get_elem, resolve, string_get_elem,
    value_of,
};

fn abs_clamp01(d: f64) -> f64 {
    let d = d.abs();
    if d > 1.0 {
        1.0
    } else {
        d
    }
}

fn describe(v: &Value) -> String {
    if v.is_null() {
        "null".to_string()
    } else {
        format!("a {}", v.type_name())
    }
}

fn check_number(v: &Value, desc: &str) -> Result<f64, MiniscriptError> {
    match v {
        Value::Number(n) => Ok(*n),
        _ => Err(MiniscriptError::type_error(format!(
            "got {} where a number was required ({desc})",
            describe(v)
        ))),
    }
}

/// Display a value the way the running machine would: container values
/// at recursion limits 1-2 may print as a global variable's name.
pub fn to_display_in(v: &Value, context: &Context) -> String {
    match v {
        Value::List(_) | Value::Map(_) => {
            let globals = Rc::clone(&context.globals);
            let finder = move |val: &Value| find_short_name_in(&globals, val);
            v.code_form(3, Some(&finder))
        }
        other => other.to_display(),
    }
}

/// Evaluate one TAC line in a context and return the value to be stored
/// into its destination.  Goto opcodes (and an intrinsic returning a
/// partial result) adjust the program counter directly.
pub fn evaluate(line: &Line, context: &mut Context) -> Result<Value, MiniscriptError> {
    if matches!(line.op, Op::AssignA | Op::ReturnA | Op::AssignImplicit) {
        // Assignment is extremely common in TAC, so short-circuit it.
        // A list or map on the right means a literal from the source,
        // whose member references must be resolved now.
        return match &line.rhs_a {
            Value::List(_) | Value::Map(_) => full_eval(&line.rhs_a, context),
            other => value_of(other, context),
        };
    }
    if line.op == Op::CopyA {
        // Used for mutable literals, so each execution of the same line
        // produces a new, distinct object.
        return match &line.rhs_a {
            Value::List(l) => eval_copy_list(l, context),
            Value::Map(m) => eval_copy_map(m, context),
            other => value_of(other, context),
        };
    }

    let op_a = value_of(&line.rhs_a, context)?;
    let op_b = value_of(&line.rhs_b, context)?;

    if line.op == Op::AisaB {
        if op_a.is_null() {
            return Ok(Value::truth(op_b.is_null()));
        }
        return Ok(Value::truth(is_a(&op_a, &op_b, context)));
    }

    if line.op == Op::ElemBofA {
        if let Value::String(ident) = &op_b {
            // String indexes resolve through the prototype chain, which
            // handles member lookup on every type.
            return resolve(&op_a, ident, context).map(|(v, _)| v);
        }
    }

    // Comparison to null works with any type.
    if line.op == Op::AEqualB && (op_a.is_null() || op_b.is_null()) {
        return Ok(Value::truth(op_a.is_null() && op_b.is_null()));
    }
    if line.op == Op::ANotEqualB && (op_a.is_null() || op_b.is_null()) {
        return Ok(Value::truth(!(op_a.is_null() && op_b.is_null())));
    }

    // Implicit coercion to string: when either side of + is a string.
    if line.op == Op::APlusB
        && (matches!(op_a, Value::String(_)) || matches!(op_b, Value::String(_)))
    {
        if op_a.is_null() {
            return Ok(op_b);
        }
        if op_b.is_null() {
            return Ok(op_a);
        }
        let sa = to_display_in(&op_a, context);
        let sb = to_display_in(&op_b, context);
        if sa.chars().count() + sb.chars().count() > MAX_STRING_SIZE {
            return Err(MiniscriptError::limit("string too large"));
        }
        return Ok(Value::string(sa + &sb));
    }

    if let Value::Number(fa) = op_a {
        match line.op {
            Op::GotoA => {
                context.line_num = fa as usize;
                return Ok(Value::Null);
            }
            Op::GotoAifB => {
                if op_b.bool_value() {
                    context.line_num = fa as usize;
                }
                return Ok(Value::Null);
            }
            Op::GotoAifTrulyB => {
                // Unlike GotoAifB, branch only if B is TRULY true: its
                // integer value is nonzero.  Used for short-circuit "or",
                // preserving fuzzy intermediates.
                if op_b.int_value() != 0 {
                    context.line_num = fa as usize;
                }
                return Ok(Value::Null);
            }
            Op::GotoAifNotB => {
                if !op_b.bool_value() {
                    context.line_num = fa as usize;
                }
                return Ok(Value::Null);
            }
            Op::CallIntrinsicA => {
                // Intrinsics do not get a fresh call context; they run in
                // the current one (usually the wrapper function's frame,
                // which bound their parameters).
                let partial = context.partial_result.take();
                let result = Intrinsic::execute(fa as usize, context, partial)?;
                if result.done {
                    return Ok(result.value);
                }
                // Not done yet: stay on this same line and call it again
                // with the partial result on the next step.
                context.partial_result = Some(result);
                context.line_num -= 1;
                return Ok(Value::Null);
            }
            Op::NotA => return Ok(Value::truth_value(1.0 - abs_clamp01(fa))),
            _ => {}
        }
        if matches!(op_b, Value::Number(_) | Value::Null) {
            let fb = op_b.double_value();
            match line.op {
                Op::APlusB => return Ok(Value::Number(fa + fb)),
                Op::AMinusB => return Ok(Value::Number(fa - fb)),
                Op::ATimesB => return Ok(Value::Number(fa * fb)),
                Op::ADividedByB => return Ok(Value::Number(fa / fb)),
                Op::AModB => return Ok(Value::Number(fa % fb)),
                Op::APowB => return Ok(Value::Number(fa.powf(fb))),
                Op::AEqualB => return Ok(Value::truth(fa == fb)),
                Op::ANotEqualB => return Ok(Value::truth(fa != fb)),
                Op::AGreaterThanB => return Ok(Value::truth(fa > fb)),
                Op::AGreatOrEqualB => return Ok(Value::truth(fa >= fb)),
                Op::ALessThanB => return Ok(Value::truth(fa < fb)),
                Op::ALessOrEqualB => return Ok(Value::truth(fa <= fb)),
                Op::AAndB => return Ok(Value::truth_value(abs_clamp01(fa * fb))),
                Op::AOrB => {
                    return Ok(Value::truth_value(abs_clamp01(fa + fb - fa * fb)));
                }
                _ => {}
            }
        }
        // A number never equals a non-number.
        if line.op == Op::AEqualB {
            return Ok(Value::ZERO);
        }
        if line.op == Op::ANotEqualB {
            return Ok(Value::ONE);
        }
    } else if let Value::String(sa) = &op_a {
        if matches!(line.op, Op::ATimesB | Op::ADividedByB) {
            let factor = if line.op == Op::ATimesB {
                check_number(&op_b, "string replication")?
            } else {
                1.0 / check_number(&op_b, "string division")?
            };
            let sa_len = sa.chars().count();
            let repeats = factor as i64;
            if repeats < 0 {
                return Ok(Value::empty_string());
            }
            if repeats as usize * sa_len > MAX_STRING_SIZE {
                return Err(MiniscriptError::limit("string too large"));
            }
            let mut result = String::new();
            for _ in 0..repeats {
                result.push_str(sa);
            }
            let extra_chars = (sa_len as f64 * (factor - repeats as f64)) as usize;
            if extra_chars > 0 {
                result.extend(sa.chars().take(extra_chars));
            }
            return Ok(Value::string(result));
        }
        if matches!(line.op, Op::ElemBofA | Op::ElemBofIterA) {
            return string_get_elem(sa, &op_b);
        }
        if matches!(op_b, Value::Null | Value::String(_)) {
            match line.op {
                Op::AMinusB => {
                    if op_b.is_null() {
                        return Ok(op_a.clone());
                    }
                    let sb = to_display_in(&op_b, context);
                    let result = match sa.strip_suffix(sb.as_str()) {
                        Some(stripped) => Value::string(stripped),
                        None => op_a.clone(),
                    };
                    return Ok(result);
                }
                Op::NotA => return Ok(Value::truth(sa.is_empty())),
                Op::AEqualB => {
                    return Ok(Value::truth(op_b.as_string() == Some(&**sa)));
                }
                Op::ANotEqualB => {
                    return Ok(Value::truth(op_b.as_string() != Some(&**sa)));
                }
                Op::AGreaterThanB | Op::AGreatOrEqualB | Op::ALessThanB | Op::ALessOrEqualB => {
                    if let Value::String(sb) = &op_b {
                        let ord = (**sa).cmp(&**sb);
                        let result = match line.op {
                            Op::AGreaterThanB => ord.is_gt(),
                            Op::AGreatOrEqualB => ord.is_ge(),
                            Op::ALessThanB => ord.is_lt(),
                            _ => ord.is_le(),
                        };
                        return Ok(Value::truth(result));
                    }
                }
                Op::LengthOfA => {
                    return Ok(Value::Number(sa.chars().count() as f64));
                }
                _ => {}
            }
        } else {
            // RHS is neither null nor a string; about all we can do is
            // equality testing.
            if line.op == Op::AEqualB {
                return Ok(Value::ZERO);
            }
            if line.op == Op::ANotEqualB {
                return Ok(Value::ONE);
            }
        }
    } else if let Value::List(list) = &op_a {
        match line.op {
            Op::ElemBofA | Op::ElemBofIterA => return list_get_elem(list, &op_b),
            Op::LengthOfA => {
                return Ok(Value::Number(list.borrow().len() as f64));
            }
            Op::AEqualB => {
                return Ok(Value::truth_value(op_a.equality(&op_b, 16)));
            }
            Op::ANotEqualB => {
                return Ok(Value::truth_value(1.0 - op_a.equality(&op_b, 16)));
            }
            Op::APlusB => {
                let list2 = match &op_b {
                    Value::List(l) => l,
                    _ => {
                        return Err(MiniscriptError::type_error(format!(
                            "got {} where a list was required (list concatenation)",
                            describe(&op_b)
                        )));
                    }
                };
                let items: Vec<Value> = list.borrow().clone();
                let items2: Vec<Value> = list2.borrow().clone();
                if items.len() + items2.len() > MAX_LIST_SIZE {
                    return Err(MiniscriptError::limit("list too large"));
                }
                let mut result = Vec::with_capacity(items.len() + items2.len());
                for v in items.iter().chain(items2.iter()) {
                    result.push(value_of(v, context)?);
                }
                return Ok(Value::list(result));
            }
            Op::ATimesB | Op::ADividedByB => {
                let factor = if line.op == Op::ATimesB {
                    check_number(&op_b, "list replication")?
                } else {
                    1.0 / check_number(&op_b, "list division")?
                };
                if factor <= 0.0 {
                    return Ok(Value::list(Vec::new()));
                }
                let items: Vec<Value> = list.borrow().clone();
                let final_count = (items.len() as f64 * factor) as usize;
                if final_count > MAX_LIST_SIZE {
                    return Err(MiniscriptError::limit("list too large"));
                }
                let mut result = Vec::with_capacity(final_count);
                for i in 0..final_count {
                    result.push(value_of(&items[i % items.len()], context)?);
                }
                return Ok(Value::list(result));
            }
            Op::NotA => return Ok(Value::truth(!op_a.bool_value())),
            _ => {}
        }
    } else if let Value::Map(map) = &op_a {
        match line.op {
            Op::ElemBofA => {
                // String keys were handled above; this is the non-string
                // map lookup, still walking the __isa chain.
                return match ValMap::lookup_pair(map, &op_b) {
                    Some((v, _)) => Ok(v),
                    None => Err(MiniscriptError::KeyNotFound(op_b.code_form(1, None))),
                };
            }
            Op::ElemBofIterA => {
                // For a map, iteration yields a {key, value} mini-map.
                return map.get_key_value_pair(op_b.int_value());
            }
            Op::LengthOfA => return Ok(Value::Number(map.count() as f64)),
            Op::AEqualB => {
                return Ok(Value::truth_value(map.equality(&op_b, 16)));
            }
            Op::ANotEqualB => {
                return Ok(Value::truth_value(1.0 - map.equality(&op_b, 16)));
            }
            Op::APlusB => {
                let map2 = match &op_b {
                    Value::Map(m) => m,
                    _ => {
                        return Err(MiniscriptError::type_error(format!(
                            "got {} where a map was required (map combination)",
                            describe(&op_b)
                        )));
                    }
                };
                let result = ValMap::new();
                for (k, v) in map.entries().into_iter().chain(map2.entries()) {
                    result.insert(k, value_of(&v, context)?);
                }
                return Ok(Value::Map(Rc::new(result)));
            }
            Op::NotA => return Ok(Value::truth(!op_a.bool_value())),
            _ => {}
        }
    } else if let (Value::Function(fa), Value::Function(fb)) = (&op_a, &op_b) {
        match line.op {
            Op::AEqualB => {
                return Ok(Value::truth(Rc::ptr_eq(&fa.func, &fb.func)));
            }
            Op::ANotEqualB => {
                return Ok(Value::truth(!Rc::ptr_eq(&fa.func, &fb.func)));
            }
            _ => {}
        }
    } else {
        match line.op {
            Op::BindAssignA => {
                if let Value::Function(func) = &op_a {
                    return Ok(func.bind_and_copy(Rc::clone(&context.variables)));
                }
            }
            Op::NotA => {
                return Ok(Value::truth(!op_a.bool_value()));
            }
            _ => {}
        }
    }

    if matches!(line.op, Op::AAndB | Op::AOrB) {
        // The number/number case returned above; here at least one side
        // is some other type, contributing its boolean value.
        let fa = if op_a.bool_value() { 1.0 } else { 0.0 };
        let fb = match &op_b {
            Value::Number(n) => *n,
            other => {
                if other.bool_value() {
                    1.0
                } else {
                    0.0
                }
            }
        };
        let result = if line.op == Op::AAndB {
            abs_clamp01(fa * fb)
        } else {
            abs_clamp01(fa + fb - fa * fb)
        };
        return Ok(Value::truth_value(result));
    }

    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineShared;
    use miniscript_core::new_code;

    fn ctx() -> Context {
        Context::root(new_code(), MachineShared::new_rc(None))
    }

    fn eval_op(op: Op, a: Value, b: Value) -> Result<Value, MiniscriptError> {
        let line = Line::new(Value::temp(1), op, a, b);
        evaluate(&line, &mut ctx())
    }

    #[test]
    fn numeric_arithmetic() {
        assert_eq!(
            eval_op(Op::APlusB, Value::Number(6.0), Value::Number(7.0))
                .unwrap()
                .double_value(),
            13.0
        );
        assert_eq!(
            eval_op(Op::APowB, Value::Number(2.0), Value::Number(10.0))
                .unwrap()
                .double_value(),
            1024.0
        );
        assert_eq!(
            eval_op(Op::AModB, Value::Number(10.0), Value::Number(3.0))
                .unwrap()
                .double_value(),
            1.0
        );
    }

    #[test]
    fn string_concat_coerces_numbers() {
        let v = eval_op(Op::APlusB, Value::string("n="), Value::Number(3.0)).unwrap();
        assert_eq!(v.as_string().unwrap(), "n=3");
        let v = eval_op(Op::APlusB, Value::Number(3.0), Value::string("!")).unwrap();
        assert_eq!(v.as_string().unwrap(), "3!");
    }

    #[test]
    fn string_plus_null_is_identity() {
        let v = eval_op(Op::APlusB, Value::string("a"), Value::Null).unwrap();
        assert_eq!(v.as_string().unwrap(), "a");
    }

    #[test]
    fn string_replication_with_fraction() {
        let v = eval_op(Op::ATimesB, Value::string("abc"), Value::Number(2.5)).unwrap();
        assert_eq!(v.as_string().unwrap(), "abcabca");
        let v = eval_op(Op::ATimesB, Value::string("abc"), Value::Number(-1.0)).unwrap();
        assert_eq!(v.as_string().unwrap(), "");
        // division replicates by the reciprocal
        let v = eval_op(Op::ADividedByB, Value::string("abcdef"), Value::Number(2.0)).unwrap();
        assert_eq!(v.as_string().unwrap(), "abc");
    }

    #[test]
    fn string_minus_strips_suffix() {
        let v = eval_op(Op::AMinusB, Value::string("hello.txt"), Value::string(".txt")).unwrap();
        assert_eq!(v.as_string().unwrap(), "hello");
        let v = eval_op(Op::AMinusB, Value::string("hello"), Value::string("xyz")).unwrap();
        assert_eq!(v.as_string().unwrap(), "hello");
    }

    #[test]
    fn string_comparison_is_lexicographic() {
        assert_eq!(
            eval_op(Op::ALessThanB, Value::string("apple"), Value::string("banana"))
                .unwrap()
                .double_value(),
            1.0
        );
        assert_eq!(
            eval_op(Op::AGreaterThanB, Value::string("a"), Value::string("b"))
                .unwrap()
                .double_value(),
            0.0
        );
    }

    #[test]
    fn null_comparisons_use_identity() {
        assert_eq!(
            eval_op(Op::AEqualB, Value::Null, Value::Null).unwrap().double_value(),
            1.0
        );
        assert_eq!(
            eval_op(Op::AEqualB, Value::string(""), Value::Null)
                .unwrap()
                .double_value(),
            0.0
        );
        assert_eq!(
            eval_op(Op::ANotEqualB, Value::Number(0.0), Value::Null)
                .unwrap()
                .double_value(),
            1.0
        );
    }

    #[test]
    fn fuzzy_and_or() {
        let v = eval_op(Op::AAndB, Value::Number(0.5), Value::Number(0.5)).unwrap();
        assert_eq!(v.double_value(), 0.25);
        let v = eval_op(Op::AOrB, Value::Number(0.5), Value::Number(0.5)).unwrap();
        assert_eq!(v.double_value(), 0.75);
        // non-numeric operands contribute their boolean value
        let v = eval_op(Op::AAndB, Value::string("x"), Value::Number(0.5)).unwrap();
        assert_eq!(v.double_value(), 0.5);
    }

    #[test]
    fn not_of_number_is_fuzzy_complement() {
        assert_eq!(
            eval_op(Op::NotA, Value::Number(0.25), Value::Null).unwrap().double_value(),
            0.75
        );
        assert_eq!(
            eval_op(Op::NotA, Value::Null, Value::Null).unwrap().double_value(),
            1.0
        );
    }

    #[test]
    fn list_concat_and_replication() {
        let a = Value::list(vec![Value::Number(1.0)]);
        let b = Value::list(vec![Value::Number(2.0)]);
        let v = eval_op(Op::APlusB, a, b).unwrap();
        assert_eq!(v.as_list().unwrap().borrow().len(), 2);

        let v = eval_op(
            Op::ATimesB,
            Value::list(vec![Value::Number(1.0), Value::Number(2.0)]),
            Value::Number(2.0),
        )
        .unwrap();
        assert_eq!(v.as_list().unwrap().borrow().len(), 4);
    }

    #[test]
    fn list_plus_non_list_is_type_error() {
        let a = Value::list(vec![]);
        assert!(matches!(
            eval_op(Op::APlusB, a, Value::Number(1.0)),
            Err(MiniscriptError::Type(_))
        ));
    }

    #[test]
    fn map_merge_right_wins() {
        let a = ValMap::new_rc();
        a.set("k", Value::Number(1.0));
        a.set("only_a", Value::ONE);
        let b = ValMap::new_rc();
        b.set("k", Value::Number(2.0));
        let v = eval_op(Op::APlusB, Value::Map(a), Value::Map(b)).unwrap();
        let m = v.as_map().unwrap();
        assert_eq!(m.get("k").unwrap().double_value(), 2.0);
        assert!(m.contains_str_key("only_a"));
    }

    #[test]
    fn map_elem_by_number_key() {
        let m = ValMap::new_rc();
        m.insert(Value::Number(1.0), Value::string("one"));
        let v = eval_op(Op::ElemBofA, Value::Map(m.clone()), Value::Number(1.0)).unwrap();
        assert_eq!(v.as_string().unwrap(), "one");
        assert!(matches!(
            eval_op(Op::ElemBofA, Value::Map(m), Value::Number(2.0)),
            Err(MiniscriptError::KeyNotFound(_))
        ));
    }

    #[test]
    fn map_iteration_yields_key_value_pairs() {
        let m = ValMap::new_rc();
        m.set("a", Value::Number(1.0));
        m.set("b", Value::Number(2.0));
        let v = eval_op(Op::ElemBofIterA, Value::Map(m), Value::Number(1.0)).unwrap();
        let pair = v.as_map().unwrap();
        assert_eq!(pair.get("key").unwrap().as_string().unwrap(), "b");
        assert_eq!(pair.get("value").unwrap().double_value(), 2.0);
    }

    #[test]
    fn goto_sets_program_counter() {
        let mut c = ctx();
        let line = Line::new(Value::Null, Op::GotoA, Value::Number(7.0), Value::Null);
        evaluate(&line, &mut c).unwrap();
        assert_eq!(c.line_num, 7);

        // GotoAifTrulyB keys on integer truth, not fuzzy truth
        let mut c = ctx();
        let line = Line::new(
            Value::Null,
            Op::GotoAifTrulyB,
            Value::Number(3.0),
            Value::Number(0.5),
        );
        evaluate(&line, &mut c).unwrap();
        assert_eq!(c.line_num, 0);
        let line = Line::new(
            Value::Null,
            Op::GotoAifB,
            Value::Number(3.0),
            Value::Number(0.5),
        );
        evaluate(&line, &mut c).unwrap();
        assert_eq!(c.line_num, 3);
    }

    #[test]
    fn bind_assign_captures_variables() {
        let mut c = ctx();
        c.set_var("n", Value::Number(1.0)).unwrap();
        let func = Value::function(Rc::new(miniscript_core::FuncDef {
            parameters: vec![],
            code: new_code(),
        }));
        let line = Line::new(Value::Null, Op::BindAssignA, func, Value::Null);
        let bound = evaluate(&line, &mut c).unwrap();
        let bound_fn = bound.as_function().unwrap();
        let outer = bound_fn.outer_vars.as_ref().unwrap();
        assert!(Rc::ptr_eq(outer, &c.variables));
    }
}
