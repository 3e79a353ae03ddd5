use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;

use miniscript_core::{
    dump, Code, FuncValue, Line, MiniscriptError, Op, SourceLoc, ValMap, Value, ISA_KEY,
};

use crate::context::Context;
use crate::eval::evaluate;
use crate::intrinsics;
use crate::resolve::{val_pair, value_of};

/// Where script output goes.  The host may swap this at any time.
pub type TextOutput = Rc<dyn Fn(&str)>;

pub fn default_output() -> TextOutput {
    Rc::new(|s: &str| println!("{s}"))
}

/// Machine-wide state reachable from every call frame: output sinks, the
/// yield flag, per-machine copies of the built-in type maps, and timing.
pub struct MachineShared {
    pub standard_output: TextOutput,
    /// Whether to store implicit results (i.e., REPL mode).
    pub store_implicit: bool,
    /// Set by the yield intrinsic; run loops return at the next step.
    pub yielding: bool,
    pub function_type: Option<Rc<ValMap>>,
    pub list_type: Option<Rc<ValMap>>,
    pub map_type: Option<Rc<ValMap>>,
    pub number_type: Option<Rc<ValMap>>,
    pub string_type: Option<Rc<ValMap>>,
    pub version_map: Option<Value>,
    pub start_time: Option<Instant>,
}

impl MachineShared {
    pub fn new_rc(standard_output: Option<TextOutput>) -> Rc<RefCell<MachineShared>> {
        Rc::new(RefCell::new(MachineShared {
            standard_output: standard_output.unwrap_or_else(default_output),
            store_implicit: false,
            yielding: false,
            function_type: None,
            list_type: None,
            map_type: None,
            number_type: None,
            string_type: None,
            version_map: None,
            start_time: None,
        }))
    }

    /// Elapsed run time in seconds (zero before the first step).
    pub fn run_time(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A complete MiniScript virtual machine: the context (call-frame)
/// stack, with the global context always at the bottom, plus methods to
/// step, run with a time limit, stop, or reset.
pub struct Machine {
    pub shared: Rc<RefCell<MachineShared>>,
    stack: Vec<Context>,
}

impl Machine {
    pub fn new(global_code: Code, standard_output: Option<TextOutput>) -> Self {
        let shared = MachineShared::new_rc(standard_output);
        let global = Context::root(global_code, Rc::clone(&shared));
        Machine {
            shared,
            stack: vec![global],
        }
    }

    pub fn done(&self) -> bool {
        self.stack.len() <= 1 && self.stack[0].done()
    }

    pub fn run_time(&self) -> f64 {
        self.shared.borrow().run_time()
    }

    pub fn yielding(&self) -> bool {
        self.shared.borrow().yielding
    }

    pub fn global_context(&self) -> &Context {
        &self.stack[0]
    }

    pub fn global_context_mut(&mut self) -> &mut Context {
        &mut self.stack[0]
    }

    pub fn top_context(&self) -> &Context {
        self.stack.last().unwrap()
    }

    pub fn top_context_mut(&mut self) -> &mut Context {
        self.stack.last_mut().unwrap()
    }

    /// Abandon execution: pop everything above the global context and
    /// jump it to the end of its code.
    pub fn stop(&mut self) {
        self.stack.truncate(1);
        self.stack[0].jump_to_end();
    }

    /// Back to the beginning of the global code, keeping global
    /// variables.
    pub fn reset(&mut self) {
        self.stack.truncate(1);
        self.stack[0].reset(false);
    }

    /// Execute one TAC line (or pop finished contexts).  Errors come
    /// back annotated with the best source location we can find.
    pub fn step(&mut self) -> Result<(), MiniscriptError> {
        if self.stack.is_empty() {
            return Ok(());
        }
        if self.shared.borrow().start_time.is_none() {
            self.shared.borrow_mut().start_time = Some(Instant::now());
        }
        while self.stack.last().unwrap().done() {
            if self.stack.len() == 1 {
                return Ok(()); // all done (can't pop the global context)
            }
            self.pop_context()?;
        }

        let line = {
            let context = self.stack.last_mut().unwrap();
            let line = context.code.borrow()[context.line_num].clone();
            context.line_num += 1;
            line
        };
        if let Err(err) = self.do_one_line(&line) {
            let located = self.locate_error(err, &line);
            debug!(error = %located.description(), "step failed");
            return Err(located);
        }
        Ok(())
    }

    fn locate_error(&self, err: MiniscriptError, line: &Line) -> MiniscriptError {
        if err.location().is_some() {
            return err;
        }
        if let Some(loc) = &line.location {
            return err.with_location(loc.clone());
        }
        for context in &self.stack {
            if let Some(loc) = context.get_source_loc() {
                return err.with_location(loc);
            }
        }
        err
    }

    fn do_one_line(&mut self, line: &Line) -> Result<(), MiniscriptError> {
        match line.op {
            Op::PushParam => {
                let context = self.stack.last_mut().unwrap();
                let val = value_of(&line.rhs_a, context)?;
                context.push_param_argument(val)
            }
            Op::CallFunctionA => self.call_function(line),
            Op::ReturnA => {
                let context = self.stack.last_mut().unwrap();
                let val = evaluate(line, context)?;
                context.store_value(&line.lhs, val)?;
                self.pop_context()
            }
            Op::AssignImplicit => {
                let context = self.stack.last_mut().unwrap();
                let val = evaluate(line, context)?;
                if context.shared.borrow().store_implicit {
                    context.store_value(&Value::var("_"), val)?;
                    context.implicit_result_counter += 1;
                }
                Ok(())
            }
            _ => {
                let context = self.stack.last_mut().unwrap();
                let val = evaluate(line, context)?;
                context.store_value(&line.lhs, val)
            }
        }
    }

    /// Resolve the callee (walking any dot chain).  A function gets a
    /// new call context with `self` and `super` bound; any other value
    /// is stored directly, unless arguments were supplied.
    fn call_function(&mut self, line: &Line) -> Result<(), MiniscriptError> {
        let context = self.stack.last_mut().unwrap();
        let (callee, found_in) = val_pair(&line.rhs_a, context)?;
        if let Value::Function(func) = &callee {
            // bind "super" to the parent of the map the function was
            // found in, and "self" to the receiver of the call (except
            // when invoking through the name `super`).
            let super_v = found_in
                .as_ref()
                .and_then(|m| m.get_raw_str(ISA_KEY))
                .unwrap_or(Value::Null);
            let mut self_value = Value::Null;
            if let Value::SeqElem(se) = &line.rhs_a {
                match &se.sequence {
                    Value::Var { name, .. } if &**name == "super" => {
                        self_value = context.self_value.clone();
                    }
                    seq => self_value = value_of(seq, context)?,
                }
            }
            let got_self = !self_value.is_null();
            let arg_count = line.rhs_b.int_value().max(0) as usize;
            let mut next =
                context.next_call_context(&func.func, arg_count, got_self, line.lhs.clone())?;
            next.outer_vars = func.outer_vars.clone();
            if found_in.is_some() {
                next.set_var("super", super_v)?;
            }
            if got_self {
                next.self_value = self_value;
            }
            self.stack.push(next);
            Ok(())
        } else {
            // Calling something that's not a function is allowed, but
            // any number of arguments is too many.
            if line.rhs_b.int_value() > 0 {
                return Err(MiniscriptError::TooManyArguments);
            }
            context.store_value(&line.lhs, callee)
        }
    }

    fn pop_context(&mut self) -> Result<(), MiniscriptError> {
        if self.stack.len() == 1 {
            return Ok(()); // down to the global context (which we keep)
        }
        let finished = self.stack.pop().unwrap();
        let result = finished.get_temp(0);
        let storage = finished.result_storage;
        let parent = self.stack.last_mut().unwrap();
        parent.store_value(&storage, result)
    }

    /// Run until done, yielded, timed out, or (optionally) blocked on an
    /// intrinsic's partial result.  Call again to resume.
    pub fn run_until_done(
        &mut self,
        time_limit: f64,
        return_early: bool,
    ) -> Result<(), MiniscriptError> {
        if self.shared.borrow().start_time.is_none() {
            self.shared.borrow_mut().start_time = Some(Instant::now());
        }
        let start_time = self.run_time();
        self.shared.borrow_mut().yielding = false;
        while !self.done() && !self.yielding() {
            if self.run_time() - start_time > time_limit {
                return Ok(()); // time's up for now
            }
            self.step()?;
            if return_early && self.top_context().partial_result.is_some() {
                return Ok(()); // waiting for something
            }
        }
        Ok(())
    }

    /// Host entry point: invoke a function value as if the script had
    /// called it with no arguments.  The next run executes it.
    pub fn manually_push_call(
        &mut self,
        func: &Rc<FuncValue>,
        result_storage: Value,
    ) -> Result<(), MiniscriptError> {
        let context = self.stack.last_mut().unwrap();
        let mut next = context.next_call_context(&func.func, 0, false, Value::Null)?;
        next.outer_vars = func.outer_vars.clone();
        next.result_storage = result_storage;
        self.stack.push(next);
        Ok(())
    }

    /// Reverse lookup of a value's name, for printing: scan the global
    /// variables for an identical value, then the intrinsics' registered
    /// short names.
    pub fn find_short_name(&self, value: &Value) -> Option<String> {
        find_short_name_in(&self.stack[0].globals, value)
    }

    /// Source location of every frame, bottom (global) first.
    pub fn get_stack(&self) -> Vec<Option<SourceLoc>> {
        self.stack.iter().map(|c| c.get_source_loc()).collect()
    }

    /// Render the top context's code for debugging.
    pub fn dump_top_context(&self) -> String {
        let context = self.top_context();
        let mut out = String::from("CODE:\n");
        dump(&context.code.borrow(), context.line_num as i64, &mut out);
        out.push_str("\nVARS:\n");
        if context.variables.is_empty() {
            out.push_str("  NONE\n");
        } else {
            for (k, v) in context.variables.entries() {
                out.push_str(&format!("  {}: {}\n", k.to_display(), v.to_display()));
            }
        }
        out
    }
}

/// Identity-based reverse lookup in a variables map, falling back to the
/// intrinsics' short-name registry.
pub fn find_short_name_in(globals: &Rc<ValMap>, value: &Value) -> Option<String> {
    for (k, v) in globals.entries() {
        if same_identity(&v, value) && !same_identity(&k, value) {
            return Some(k.to_display());
        }
    }
    intrinsics::lookup_short_name(value)
}

/// Reference identity, for the short-name scan.
pub(crate) fn same_identity(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Map(x), Value::Map(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(&x.func, &y.func),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniscript_core::new_code;

    fn machine_with(lines: Vec<Line>) -> Machine {
        let code = new_code();
        code.borrow_mut().extend(lines);
        Machine::new(code, None)
    }

    #[test]
    fn runs_simple_assignment() {
        let mut vm = machine_with(vec![Line::new(
            Value::var("x"),
            Op::AssignA,
            Value::Number(42.0),
            Value::Null,
        )]);
        vm.run_until_done(60.0, true).unwrap();
        assert!(vm.done());
        assert_eq!(
            vm.global_context().get_local("x").unwrap().double_value(),
            42.0
        );
    }

    #[test]
    fn error_carries_location() {
        let mut line = Line::new(
            Value::temp(0),
            Op::AssignA,
            Value::var("missing"),
            Value::Null,
        );
        line.location = Some(SourceLoc::new(None, 12));
        let mut vm = machine_with(vec![line]);
        let err = vm.run_until_done(60.0, true).unwrap_err();
        assert_eq!(err.location().unwrap().line_num, 12);
        assert!(err.description().starts_with("Runtime Error: Undefined Identifier"));
    }

    #[test]
    fn stop_abandons_execution() {
        let mut vm = machine_with(vec![
            Line::new(Value::var("x"), Op::AssignA, Value::ONE, Value::Null),
            Line::new(Value::var("y"), Op::AssignA, Value::ONE, Value::Null),
        ]);
        vm.step().unwrap();
        vm.stop();
        assert!(vm.done());
        assert!(vm.global_context().get_local("y").is_none());
    }

    #[test]
    fn find_short_name_scans_globals() {
        let mut vm = machine_with(vec![]);
        let map = Value::new_map();
        vm.global_context_mut()
            .set_var("thing", map.clone())
            .unwrap();
        assert_eq!(vm.find_short_name(&map).unwrap(), "thing");
        assert!(vm.find_short_name(&Value::Number(1.0)).is_none());
    }
}
