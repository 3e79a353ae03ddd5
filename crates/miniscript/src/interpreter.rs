use tracing::debug;

use miniscript_core::{MiniscriptError, Value};
use miniscript_parser::Parser;
use miniscript_vm::eval::to_display_in;
use miniscript_vm::{default_output, Machine, TextOutput};

/// The host-facing interpreter: owns a parser and a machine, and routes
/// script output (normal, implicit, and error) to the host's sinks.
pub struct Interpreter {
    source: String,
    parser: Option<Parser>,
    /// The running machine, for advanced host use.
    pub vm: Option<Machine>,
    standard_output: TextOutput,
    /// Receives the value of bare expressions in REPL mode.
    pub implicit_output: Option<TextOutput>,
    /// Receives formatted error descriptions.
    pub error_output: TextOutput,
}

impl Interpreter {
    pub fn new(source: impl Into<String>) -> Self {
        Self::with_outputs(source, None, None)
    }

    pub fn with_outputs(
        source: impl Into<String>,
        standard_output: Option<TextOutput>,
        error_output: Option<TextOutput>,
    ) -> Self {
        Interpreter {
            source: source.into(),
            parser: None,
            vm: None,
            standard_output: standard_output.unwrap_or_else(default_output),
            implicit_output: None,
            error_output: error_output
                .unwrap_or_else(|| std::rc::Rc::new(|s: &str| eprintln!("{s}"))),
        }
    }

    pub fn standard_output(&self) -> TextOutput {
        self.standard_output.clone()
    }

    pub fn set_standard_output(&mut self, output: TextOutput) {
        self.standard_output = output.clone();
        if let Some(vm) = &self.vm {
            vm.shared.borrow_mut().standard_output = output;
        }
    }

    /// True when there is no machine, or the machine has reached the end
    /// of its code.
    pub fn done(&self) -> bool {
        self.vm.as_ref().map_or(true, Machine::done)
    }

    pub fn running(&self) -> bool {
        self.vm.as_ref().is_some_and(|vm| !vm.done())
    }

    /// Whether the parser is waiting for more input (an open block or a
    /// continued line).  An interactive console uses this to switch its
    /// prompt.
    pub fn need_more_input(&self) -> bool {
        self.parser.as_ref().is_some_and(Parser::need_more_input)
    }

    /// Stop the machine and jump to the end of the program; also reset
    /// the parser in case it's stuck waiting for a block ender.
    pub fn stop(&mut self) {
        if let Some(vm) = &mut self.vm {
            vm.stop();
        }
        if let Some(parser) = &mut self.parser {
            parser.partial_reset();
        }
    }

    /// Reset the interpreter with the given source code.
    pub fn reset(&mut self, source: impl Into<String>) {
        self.source = source.into();
        self.parser = None;
        self.vm = None;
    }

    /// Back to the beginning of the code: clears the stack but keeps
    /// global variables, so a short script can run over and over
    /// without recompiling.
    pub fn restart(&mut self) {
        if let Some(vm) = &mut self.vm {
            vm.reset();
        }
    }

    /// Compile the source, if not already compiled, so that we're either
    /// ready to run or have reported compiler errors via `error_output`.
    pub fn compile(&mut self) {
        if self.vm.is_some() {
            return;
        }
        if self.parser.is_none() {
            self.parser = Some(Parser::new());
        }
        let source = self.source.clone();
        let parser = self.parser.as_mut().unwrap();
        match parser.parse(&source) {
            Ok(()) => {
                let vm = parser.create_vm(Some(self.standard_output.clone()));
                debug!("compiled {} source bytes", source.len());
                self.vm = Some(vm);
            }
            Err(e) => self.report_error(&e),
        }
    }

    /// Run until the end of the code or the time limit, whichever comes
    /// first; call again to continue right where it left off.  With
    /// `return_early`, also return as soon as an intrinsic reports a
    /// partial result, so the host can do other work and resume later.
    pub fn run_until_done(&mut self, time_limit: f64, return_early: bool) {
        if self.vm.is_none() {
            self.compile();
            if self.vm.is_none() {
                return; // must have been a compile error
            }
        }
        let result = self
            .vm
            .as_mut()
            .unwrap()
            .run_until_done(time_limit, return_early);
        if let Err(e) = result {
            self.report_error(&e);
            self.stop();
        }
    }

    /// Run one step of the virtual machine.
    pub fn step(&mut self) {
        self.compile();
        if let Some(vm) = &mut self.vm {
            if let Err(e) = vm.step() {
                self.report_error(&e);
                self.stop();
            }
        }
    }

    /// Read-Eval-Print Loop: run one line of source until it terminates
    /// or the time limit passes, then print any new implicit result to
    /// `implicit_output`.
    pub fn repl(&mut self, source_line: &str, time_limit: f64) {
        if self.parser.is_none() {
            self.parser = Some(Parser::new());
        }
        if self.vm.is_none() {
            let vm = self
                .parser
                .as_ref()
                .unwrap()
                .create_vm(Some(self.standard_output.clone()));
            self.vm = Some(vm);
        } else if self.done() && !self.parser.as_ref().unwrap().need_more_input() {
            // Machine and parser are both done, so the previously
            // compiled code will never run again; clear it out.
            self.vm
                .as_mut()
                .unwrap()
                .global_context_mut()
                .clear_code_and_temps();
            self.parser.as_mut().unwrap().partial_reset();
        }

        if source_line == "#DUMP" {
            let dump = self.vm.as_ref().unwrap().dump_top_context();
            (self.standard_output)(&dump);
            return;
        }

        let (start_time, start_impl_count) = {
            let vm = self.vm.as_ref().unwrap();
            (
                vm.run_time(),
                vm.global_context().implicit_result_counter,
            )
        };
        {
            let vm = self.vm.as_ref().unwrap();
            let mut shared = vm.shared.borrow_mut();
            shared.store_implicit = self.implicit_output.is_some();
            shared.yielding = false;
        }

        if let Err(e) = self
            .parser
            .as_mut()
            .unwrap()
            .parse_with_mode(source_line, true)
        {
            self.report_error(&e);
            self.stop();
            return;
        }
        if self.parser.as_ref().unwrap().need_more_input() {
            return;
        }

        loop {
            let step_result = {
                let vm = self.vm.as_mut().unwrap();
                if vm.done() || vm.yielding() {
                    break;
                }
                if vm.run_time() - start_time > time_limit {
                    return; // time's up for now
                }
                vm.step()
            };
            if let Err(e) = step_result {
                self.report_error(&e);
                self.stop();
                return;
            }
        }

        if let Some(implicit) = self.implicit_output.clone() {
            let vm = self.vm.as_mut().unwrap();
            if vm.global_context().implicit_result_counter > start_impl_count {
                if let Ok(result) = vm.global_context_mut().get_var("_") {
                    if !result.is_null() {
                        implicit(&to_display_in(&result, vm.global_context()));
                    }
                }
            }
        }
    }

    /// A value from the interpreter's global namespace, or `None` if the
    /// name is not defined (or nothing has been compiled).
    pub fn get_global_value(&mut self, var_name: &str) -> Option<Value> {
        let vm = self.vm.as_mut()?;
        vm.global_context_mut().get_var(var_name).ok()
    }

    /// Set a value in the interpreter's global namespace.
    pub fn set_global_value(
        &mut self,
        var_name: &str,
        value: Value,
    ) -> Result<(), MiniscriptError> {
        if let Some(vm) = &mut self.vm {
            vm.global_context_mut().set_var(var_name, value)?;
        }
        Ok(())
    }

    fn report_error(&self, e: &MiniscriptError) {
        (self.error_output)(&e.description());
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new("")
    }
}
