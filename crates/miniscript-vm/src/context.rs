use std::cell::RefCell;
use std::rc::Rc;

use miniscript_core::{
    Code, FuncDef, MiniscriptError, SourceLoc, ValMap, Value, MAX_ARG_STACK,
};

use crate::intrinsics::{Intrinsic, IntrinsicResult};
use crate::machine::MachineShared;
use crate::resolve::value_of;

/// One call frame: the code being executed, the program counter, local
/// variables, the closure environment, `self`, the argument stack being
/// built for the next call, and the lvalue in the caller that receives
/// the return value.
pub struct Context {
    pub code: Code,
    pub line_num: usize,
    pub variables: Rc<ValMap>,
    pub outer_vars: Option<Rc<ValMap>>,
    pub self_value: Value,
    pub args: Vec<Value>,
    pub result_storage: Value,
    pub partial_result: Option<IntrinsicResult>,
    pub implicit_result_counter: usize,
    /// Root (global) variables map, shared by every frame of a machine.
    pub globals: Rc<ValMap>,
    /// Machine-wide state (outputs, type maps, timing, yield flag).
    pub shared: Rc<RefCell<MachineShared>>,
    temps: Vec<Value>,
}

impl Context {
    /// Create the root (global) context: its variables map is the
    /// globals map.
    pub fn root(code: Code, shared: Rc<RefCell<MachineShared>>) -> Self {
        let variables = ValMap::new_rc();
        Context {
            code,
            line_num: 0,
            globals: Rc::clone(&variables),
            variables,
            outer_vars: None,
            self_value: Value::Null,
            args: Vec::new(),
            result_storage: Value::Null,
            partial_result: None,
            implicit_result_counter: 0,
            shared,
            temps: Vec::new(),
        }
    }

    fn child(code: Code, shared: Rc<RefCell<MachineShared>>, globals: Rc<ValMap>) -> Self {
        Context {
            code,
            line_num: 0,
            variables: ValMap::new_rc(),
            outer_vars: None,
            self_value: Value::Null,
            args: Vec::new(),
            result_storage: Value::Null,
            partial_result: None,
            implicit_result_counter: 0,
            globals,
            shared,
            temps: Vec::new(),
        }
    }

    pub fn done(&self) -> bool {
        self.line_num >= self.code.borrow().len()
    }

    fn is_root(&self) -> bool {
        Rc::ptr_eq(&self.variables, &self.globals)
    }

    /// Reset to the first line, dropping temporaries and (optionally)
    /// local variables.
    pub fn reset(&mut self, clear_variables: bool) {
        self.line_num = 0;
        self.temps.clear();
        if clear_variables {
            let fresh = ValMap::new_rc();
            if self.is_root() {
                self.globals = Rc::clone(&fresh);
            }
            self.variables = fresh;
        }
    }

    pub fn jump_to_end(&mut self) {
        self.line_num = self.code.borrow().len();
    }

    /// Drop all compiled code and temporaries.  The REPL uses this once a
    /// program has finished, since the old lines will never run again.
    pub fn clear_code_and_temps(&mut self) {
        self.code.borrow_mut().clear();
        self.line_num = 0;
        self.temps.clear();
    }

    pub fn get_source_loc(&self) -> Option<SourceLoc> {
        let code = self.code.borrow();
        code.get(self.line_num).and_then(|l| l.location.clone())
    }

    // ── Temporaries ───────────────────────────────────────────────

    pub fn set_temp(&mut self, temp_num: usize, value: Value) {
        if self.temps.len() <= temp_num {
            self.temps.resize(temp_num + 1, Value::Null);
        }
        self.temps[temp_num] = value;
    }

    pub fn get_temp(&self, temp_num: usize) -> Value {
        self.temps.get(temp_num).cloned().unwrap_or(Value::Null)
    }

    // ── Variables ─────────────────────────────────────────────────

    pub fn set_var(&mut self, identifier: &str, value: Value) -> Result<(), MiniscriptError> {
        if identifier == "globals" || identifier == "locals" {
            return Err(MiniscriptError::runtime(format!(
                "can't assign to {identifier}"
            )));
        }
        if identifier == "self" {
            self.self_value = value.clone();
        }
        self.variables
            .set_elem(Value::string(identifier), value);
        Ok(())
    }

    /// Get a local variable only; no other scopes, no special built-ins.
    /// Returns `None` when the name isn't bound at all (a bound null is
    /// `Some(Value::Null)`).
    pub fn get_local(&self, identifier: &str) -> Option<Value> {
        self.variables.get_raw_str(identifier)
    }

    pub fn get_local_int(&self, identifier: &str, default: i64) -> i64 {
        match self.get_local(identifier) {
            Some(v) => v.int_value(),
            None => default,
        }
    }

    pub fn get_local_f64(&self, identifier: &str, default: f64) -> f64 {
        match self.get_local(identifier) {
            Some(Value::Null) => 0.0,
            Some(v) => v.double_value(),
            None => default,
        }
    }

    pub fn get_local_bool(&self, identifier: &str, default: bool) -> bool {
        match self.get_local(identifier) {
            Some(Value::Null) => false,
            Some(v) => v.bool_value(),
            None => default,
        }
    }

    pub fn get_local_string(&self, identifier: &str, default: &str) -> String {
        match self.get_local(identifier) {
            Some(Value::Null) => default.to_string(),
            Some(v) => v.to_display(),
            None => default.to_string(),
        }
    }

    /// Resolve an identifier: special built-ins, locals, the closure
    /// environment, globals, then intrinsics.
    pub fn get_var(&mut self, identifier: &str) -> Result<Value, MiniscriptError> {
        match identifier {
            "self" => return Ok(self.self_value.clone()),
            "locals" => return Ok(Value::Map(Rc::clone(&self.variables))),
            "globals" => return Ok(Value::Map(Rc::clone(&self.globals))),
            "outer" => {
                return Ok(Value::Map(match &self.outer_vars {
                    Some(outer) => Rc::clone(outer),
                    None => Rc::clone(&self.globals),
                }));
            }
            _ => {}
        }
        if let Some(v) = self.variables.get_raw_str(identifier) {
            return Ok(v);
        }
        if let Some(outer) = &self.outer_vars {
            if let Some(v) = outer.get_raw_str(identifier) {
                return Ok(v);
            }
        }
        if !self.is_root() {
            if let Some(v) = self.globals.get_raw_str(identifier) {
                return Ok(v);
            }
        }
        if let Some(intrinsic) = Intrinsic::get_by_name(identifier) {
            return Ok(intrinsic.get_func());
        }
        Err(MiniscriptError::UndefinedIdentifier(identifier.to_string()))
    }

    /// Store a value through an lvalue: a temporary, a variable, or an
    /// indexed element.  A null lvalue stores nothing.
    pub fn store_value(&mut self, lhs: &Value, value: Value) -> Result<(), MiniscriptError> {
        match lhs {
            Value::Null => Ok(()),
            Value::Temp(n) => {
                self.set_temp(*n, value);
                Ok(())
            }
            Value::Var { name, .. } => self.set_var(name, value),
            Value::SeqElem(se) => {
                let seq = value_of(&se.sequence, self)?;
                if seq.is_null() {
                    return Err(MiniscriptError::runtime(
                        "can't set indexed element of null",
                    ));
                }
                let index = match &se.index {
                    Value::Var { .. } | Value::SeqElem(_) | Value::Temp(_) => {
                        value_of(&se.index, self)?
                    }
                    other => other.clone(),
                };
                match &seq {
                    Value::List(l) => {
                        let mut values = l.borrow_mut();
                        let mut i = index.int_value();
                        if i < 0 {
                            i += values.len() as i64;
                        }
                        if i < 0 || i as usize >= values.len() {
                            return Err(MiniscriptError::index(format!(
                                "Index Error (list index {index} out of range)"
                            )));
                        }
                        values[i as usize] = value;
                        Ok(())
                    }
                    Value::Map(m) => {
                        m.set_elem(index, value);
                        Ok(())
                    }
                    _ => Err(MiniscriptError::runtime(
                        "can't set an indexed element in this type",
                    )),
                }
            }
            _ => Err(MiniscriptError::runtime("not an lvalue")),
        }
    }

    // ── Calls ─────────────────────────────────────────────────────

    /// Stash an argument for an upcoming call.
    pub fn push_param_argument(&mut self, arg: Value) -> Result<(), MiniscriptError> {
        if self.args.len() >= MAX_ARG_STACK {
            return Err(MiniscriptError::runtime("Argument limit exceeded"));
        }
        self.args.push(arg);
        Ok(())
    }

    /// Build the context for the next call, popping `arg_count` pushed
    /// arguments (which arrive in reverse order) and binding them to
    /// parameters.  When invoked with dot syntax (`got_self`), a leading
    /// `self` parameter is skipped and bound from the receiver instead.
    pub fn next_call_context(
        &mut self,
        func: &Rc<FuncDef>,
        arg_count: usize,
        got_self: bool,
        result_storage: Value,
    ) -> Result<Context, MiniscriptError> {
        let mut result = Context::child(
            Rc::clone(&func.code),
            Rc::clone(&self.shared),
            Rc::clone(&self.globals),
        );
        result.result_storage = result_storage;

        let self_param = if got_self
            && !func.parameters.is_empty()
            && func.parameters[0].name == "self"
        {
            1
        } else {
            0
        };
        for i in 0..arg_count {
            let argument = match self.args.pop() {
                Some(a) => a,
                None => return Err(MiniscriptError::runtime("argument stack underflow")),
            };
            let param_num = arg_count - 1 - i + self_param;
            if param_num >= func.parameters.len() {
                return Err(MiniscriptError::TooManyArguments);
            }
            let param = &func.parameters[param_num].name;
            if param == "self" {
                result.self_value = argument;
            } else {
                result.set_var(param, argument)?;
            }
        }
        for param_num in (arg_count + self_param)..func.parameters.len() {
            let param = func.parameters[param_num].clone();
            result.set_var(&param.name, param.default_value)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineShared;
    use miniscript_core::{new_code, Param};

    fn test_context() -> Context {
        Context::root(new_code(), MachineShared::new_rc(None))
    }

    #[test]
    fn temps_grow_on_demand() {
        let mut ctx = test_context();
        ctx.set_temp(3, Value::Number(7.0));
        assert!(ctx.get_temp(0).is_null());
        assert_eq!(ctx.get_temp(3).double_value(), 7.0);
        assert!(ctx.get_temp(9).is_null());
    }

    #[test]
    fn get_var_resolution_order() {
        let mut ctx = test_context();
        ctx.set_var("x", Value::Number(1.0)).unwrap();
        assert_eq!(ctx.get_var("x").unwrap().double_value(), 1.0);
        // unknown names fall through to intrinsics, then fail
        assert!(ctx.get_var("pi").unwrap().as_function().is_some());
        assert!(matches!(
            ctx.get_var("nonesuch"),
            Err(MiniscriptError::UndefinedIdentifier(_))
        ));
    }

    #[test]
    fn locals_and_globals_are_special() {
        let mut ctx = test_context();
        ctx.set_var("g", Value::Number(9.0)).unwrap();
        let locals = ctx.get_var("locals").unwrap();
        assert!(locals.as_map().unwrap().contains_str_key("g"));
        assert!(ctx.set_var("globals", Value::Null).is_err());
        assert!(ctx.set_var("locals", Value::Null).is_err());
    }

    #[test]
    fn child_frame_sees_globals_not_parent_locals() {
        let mut root = test_context();
        root.set_var("g", Value::Number(5.0)).unwrap();
        let func = Rc::new(FuncDef {
            parameters: vec![],
            code: new_code(),
        });
        let mut child = root.next_call_context(&func, 0, false, Value::Null).unwrap();
        assert_eq!(child.get_var("g").unwrap().double_value(), 5.0);
        child.set_var("loc", Value::ONE).unwrap();
        assert!(root.get_local("loc").is_none());
    }

    #[test]
    fn args_bind_in_reverse_with_defaults() {
        let mut root = test_context();
        let func = Rc::new(FuncDef {
            parameters: vec![
                Param::new("a", Value::Null),
                Param::new("b", Value::Number(42.0)),
            ],
            code: new_code(),
        });
        root.push_param_argument(Value::Number(1.0)).unwrap();
        let child = root.next_call_context(&func, 1, false, Value::Null).unwrap();
        assert_eq!(child.get_local("a").unwrap().double_value(), 1.0);
        assert_eq!(child.get_local("b").unwrap().double_value(), 42.0);
    }

    #[test]
    fn too_many_arguments_fails() {
        let mut root = test_context();
        let func = Rc::new(FuncDef {
            parameters: vec![],
            code: new_code(),
        });
        root.push_param_argument(Value::ONE).unwrap();
        assert!(matches!(
            root.next_call_context(&func, 1, false, Value::Null),
            Err(MiniscriptError::TooManyArguments)
        ));
    }

    #[test]
    fn argument_stack_depth_is_limited() {
        let mut ctx = test_context();
        for _ in 0..MAX_ARG_STACK {
            ctx.push_param_argument(Value::ONE).unwrap();
        }
        assert!(ctx.push_param_argument(Value::ONE).is_err());
    }

    #[test]
    fn store_through_seq_elem() {
        let mut ctx = test_context();
        ctx.set_var("a", Value::list(vec![Value::ZERO, Value::ZERO]))
            .unwrap();
        let lhs = Value::seq_elem(Value::var("a"), Value::Number(1.0));
        ctx.store_value(&lhs, Value::Number(9.0)).unwrap();
        let a = ctx.get_local("a").unwrap();
        assert_eq!(a.as_list().unwrap().borrow()[1].double_value(), 9.0);

        let bad = Value::seq_elem(Value::var("a"), Value::Number(5.0));
        assert!(ctx.store_value(&bad, Value::ONE).is_err());
    }
}
