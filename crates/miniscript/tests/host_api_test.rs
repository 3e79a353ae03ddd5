use std::cell::RefCell;
use std::rc::Rc;

use miniscript::{Interpreter, TextOutput, Value};

fn capture() -> (TextOutput, Rc<RefCell<Vec<String>>>) {
    let output: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink: TextOutput = {
        let output = Rc::clone(&output);
        Rc::new(move |s: &str| output.borrow_mut().push(s.to_string()))
    };
    (sink, output)
}

#[test]
fn get_and_set_global_values() {
    let mut interpreter = Interpreter::new("x = 41");
    interpreter.run_until_done(60.0, false);
    assert_eq!(
        interpreter.get_global_value("x").unwrap().double_value(),
        41.0
    );
    assert!(interpreter.get_global_value("nope").is_none());

    interpreter.set_global_value("y", Value::Number(1.0)).unwrap();
    assert_eq!(
        interpreter.get_global_value("y").unwrap().double_value(),
        1.0
    );
}

#[test]
fn restart_runs_again_without_recompiling() {
    let (sink, output) = capture();
    let mut interpreter = Interpreter::with_outputs("print \"go\"", Some(sink), None);
    interpreter.run_until_done(60.0, false);
    interpreter.restart();
    interpreter.run_until_done(60.0, false);
    assert_eq!(*output.borrow(), ["go", "go"]);
}

#[test]
fn reset_takes_new_source() {
    let (sink, output) = capture();
    let mut interpreter = Interpreter::with_outputs("print 1", Some(sink), None);
    interpreter.run_until_done(60.0, false);
    interpreter.reset("print 2");
    interpreter.run_until_done(60.0, false);
    assert_eq!(*output.borrow(), ["1", "2"]);
}

#[test]
fn step_advances_one_tac_line_at_a_time() {
    let (sink, output) = capture();
    let mut interpreter = Interpreter::with_outputs("print 1\nprint 2", Some(sink), None);
    interpreter.compile();
    // a print statement spans several TAC lines, so step until the
    // first line of output lands
    while output.borrow().is_empty() {
        interpreter.step();
    }
    assert_eq!(*output.borrow(), ["1"]);
    while !interpreter.done() {
        interpreter.step();
    }
    assert_eq!(*output.borrow(), ["1", "2"]);
}

#[test]
fn stop_abandons_the_run() {
    let (sink, output) = capture();
    let mut interpreter =
        Interpreter::with_outputs("print 1\nprint 2\nprint 3", Some(sink), None);
    interpreter.compile();
    while output.borrow().is_empty() {
        interpreter.step();
    }
    interpreter.stop();
    assert!(interpreter.done());
    assert_eq!(*output.borrow(), ["1"]);
}

#[test]
fn return_early_pauses_on_partial_results() {
    let (sink, output) = capture();
    let mut interpreter =
        Interpreter::with_outputs("print \"a\"\nwait 0.01\nprint \"b\"", Some(sink), None);
    interpreter.run_until_done(60.0, true);
    // paused inside wait; "b" not yet printed
    assert_eq!(*output.borrow(), ["a"]);
    assert!(!interpreter.done());
    while !interpreter.done() {
        interpreter.run_until_done(60.0, true);
    }
    assert_eq!(*output.borrow(), ["a", "b"]);
}

#[test]
fn manually_push_call_invokes_a_function() {
    let (sink, output) = capture();
    let mut interpreter = Interpreter::with_outputs(
        "f = function()\nprint \"called\"\nend function",
        Some(sink),
        None,
    );
    interpreter.run_until_done(60.0, false);
    assert_eq!(output.borrow().len(), 0);

    let func = match interpreter.get_global_value("f") {
        Some(Value::Function(f)) => f,
        other => panic!("expected a function, got {other:?}"),
    };
    let vm = interpreter.vm.as_mut().unwrap();
    vm.manually_push_call(&func, Value::Null).unwrap();
    interpreter.run_until_done(60.0, false);
    assert_eq!(*output.borrow(), ["called"]);
}

#[test]
fn swapping_standard_output_redirects_print() {
    let (sink_a, output_a) = capture();
    let (sink_b, output_b) = capture();
    let mut interpreter = Interpreter::with_outputs("print 1\nprint 2", Some(sink_a), None);
    interpreter.compile();
    while output_a.borrow().is_empty() {
        interpreter.step();
    }
    interpreter.set_standard_output(sink_b);
    interpreter.run_until_done(60.0, false);
    assert_eq!(*output_a.borrow(), ["1"]);
    assert_eq!(*output_b.borrow(), ["2"]);
}
