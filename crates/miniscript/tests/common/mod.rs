use std::cell::RefCell;
use std::rc::Rc;

use miniscript::{Interpreter, TextOutput};

/// Run a script to completion, capturing everything sent to the
/// standard and error outputs, one line per entry.
#[allow(dead_code)]
pub fn run(src: &str) -> Vec<String> {
    let output: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink: TextOutput = {
        let output = Rc::clone(&output);
        Rc::new(move |s: &str| output.borrow_mut().push(s.to_string()))
    };
    let mut interpreter = Interpreter::with_outputs(src, Some(sink.clone()), Some(sink));
    loop {
        interpreter.run_until_done(60.0, false);
        if interpreter.done() {
            break;
        }
    }
    let result = output.borrow().clone();
    result
}

/// Feed lines to a REPL one at a time, capturing standard, implicit,
/// and error output together.
#[allow(dead_code)]
pub fn repl_session(lines: &[&str]) -> Vec<String> {
    let output: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink: TextOutput = {
        let output = Rc::clone(&output);
        Rc::new(move |s: &str| output.borrow_mut().push(s.to_string()))
    };
    let mut interpreter = Interpreter::with_outputs("", Some(sink.clone()), Some(sink.clone()));
    interpreter.implicit_output = Some(sink);
    for line in lines {
        interpreter.repl(line, 60.0);
    }
    let result = output.borrow().clone();
    result
}

#[allow(dead_code)]
pub fn expect(src: &str, expected: &[&str]) {
    let actual = run(src);
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    assert_eq!(actual, expected, "script:\n{src}");
}
