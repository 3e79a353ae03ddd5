mod common;

use common::repl_session;

#[test]
fn implicit_results_are_printed() {
    assert_eq!(repl_session(&["1 + 2"]), ["3"]);
    assert_eq!(repl_session(&["\"abc\".upper"]), ["ABC"]);
}

#[test]
fn assignments_print_nothing() {
    assert_eq!(repl_session(&["x = 1"]), Vec::<String>::new());
}

#[test]
fn globals_persist_between_lines() {
    assert_eq!(repl_session(&["x = 40", "x + 2"]), ["42"]);
}

#[test]
fn multi_line_function_definition() {
    assert_eq!(
        repl_session(&["f = function(n)", "return n * 2", "end function", "f(21)"]),
        ["42"]
    );
}

#[test]
fn multi_line_loop() {
    assert_eq!(
        repl_session(&[
            "total = 0",
            "for i in range(1, 3)",
            "total = total + i",
            "end for",
            "total",
        ]),
        ["6"]
    );
}

#[test]
fn line_continuation_buffers_input() {
    assert_eq!(repl_session(&["x = 1 +", "2", "x"]), ["3"]);
}

#[test]
fn need_more_input_switches_with_open_blocks() {
    let mut interpreter = miniscript::Interpreter::new("");
    interpreter.repl("if true then", 60.0);
    assert!(interpreter.need_more_input());
    interpreter.repl("end if", 60.0);
    assert!(!interpreter.need_more_input());
}

#[test]
fn errors_recover_and_accept_more_input() {
    let out = repl_session(&["print nope", "print 42"]);
    assert_eq!(out.len(), 2);
    assert!(out[0].starts_with("Runtime Error: Undefined Identifier"));
    assert_eq!(out[1], "42");
}

#[test]
fn compile_error_recovers() {
    let out = repl_session(&["end while", "1 + 1"]);
    assert_eq!(out.len(), 2);
    assert!(out[0].starts_with("Compiler Error:"), "{}", out[0]);
    assert_eq!(out[1], "2");
}

#[test]
fn finished_code_is_cleared_between_lines() {
    let mut interpreter = miniscript::Interpreter::new("");
    interpreter.repl("x = 1", 60.0);
    interpreter.repl("y = 2", 60.0);
    // only the latest line's code remains
    {
        let vm = interpreter.vm.as_ref().unwrap();
        assert_eq!(vm.global_context().code.borrow().len(), 1);
    }
    // but earlier globals survive
    let x = interpreter.get_global_value("x").unwrap();
    assert_eq!(x.double_value(), 1.0);
}

#[test]
fn implicit_results_use_global_short_names() {
    assert_eq!(
        repl_session(&["Shape = {}", "x = new Shape", "x"]),
        ["{\"__isa\": Shape}"]
    );
}

#[test]
fn dump_prints_code_listing() {
    let out = repl_session(&["x = 1", "#DUMP"]);
    assert!(out.iter().any(|l| l.starts_with("CODE:")), "{out:?}");
}
