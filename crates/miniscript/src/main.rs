use clap::Parser as CliParser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use miniscript::Interpreter;

#[derive(CliParser)]
#[command(name = "miniscript", about = "MiniScript interpreter and REPL", version)]
struct Cli {
    /// Script file to run; with no file, start the REPL
    file: Option<String>,

    /// Print the compiled TAC before running
    #[arg(long)]
    dump_tac: bool,

    /// Suppress the REPL banner
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    miniscript::set_host_info("miniscript-cli", "https://miniscript.org", 1.0);

    let cli = Cli::parse();
    match &cli.file {
        Some(path) => run_file(path, cli.dump_tac),
        None => repl(cli.quiet),
    }
}

fn run_file(path: &str, dump_tac: bool) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Unable to read {path}: {e}");
            std::process::exit(1);
        }
    };
    let mut interpreter = Interpreter::new(source);
    interpreter.compile();
    let Some(vm) = &interpreter.vm else {
        std::process::exit(1); // compile error, already reported
    };
    if dump_tac {
        println!("{}", vm.dump_top_context());
    }
    while !interpreter.done() {
        interpreter.run_until_done(60.0, true);
    }
}

fn repl(quiet: bool) {
    let mut interpreter = Interpreter::new("");
    interpreter.implicit_output = Some(interpreter.standard_output());

    if !quiet {
        println!("MiniScript {}", env!("CARGO_PKG_VERSION"));
        println!("Type control-D to exit.\n");
    }

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Unable to start line editor: {e}");
            std::process::exit(1);
        }
    };

    loop {
        let prompt = if interpreter.need_more_input() {
            ">>> "
        } else {
            "> "
        };
        match editor.readline(prompt) {
            Ok(line) => {
                let _ = editor.add_history_entry(&line);
                interpreter.repl(&line, 60.0);
            }
            Err(ReadlineError::Interrupted) => {
                // abandon any half-entered block and keep going
                interpreter.stop();
                println!("^C");
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {e}");
                break;
            }
        }
    }
}
