use std::rc::Rc;

use miniscript_core::{
    new_code, Code, FuncDef, Line, MiniscriptError, Op, Param, SeqElem, SourceLoc, ValMap, Value,
    ISA_KEY,
};
use miniscript_lexer::{Lexer, Token, TokenType};
use miniscript_vm::{compile_slice, Machine, TextOutput};

/// A place where the code must be patched with a jump destination once
/// we know it (when the matching block terminator arrives).
struct BackPatch {
    line_num: usize,
    waiting_for: String,
}

/// A place we will need to jump back to later (the top of a loop).
struct JumpPoint {
    line_num: usize,
    keyword: String,
}

/// One compilation target: the code block being emitted, its pending
/// back-patches and open loop headers, and the temporary counter.
struct ParseState {
    code: Code,
    backpatches: Vec<BackPatch>,
    jump_points: Vec<JumpPoint>,
    next_temp_num: usize,
}

impl ParseState {
    fn new() -> Self {
        ParseState {
            code: new_code(),
            backpatches: Vec::new(),
            jump_points: Vec::new(),
            next_temp_num: 0,
        }
    }

    fn add(&mut self, line: Line) {
        self.code.borrow_mut().push(line);
    }

    fn code_len(&self) -> usize {
        self.code.borrow().len()
    }

    /// Record the last code line as waiting for the given terminator.
    fn add_backpatch(&mut self, wait_for: &str) {
        self.backpatches.push(BackPatch {
            line_num: self.code_len() - 1,
            waiting_for: wait_for.to_string(),
        });
    }

    fn add_jump_point(&mut self, keyword: &str) {
        self.jump_points.push(JumpPoint {
            line_num: self.code_len(),
            keyword: keyword.to_string(),
        });
    }

    fn close_jump_point(&mut self, keyword: &str) -> Result<JumpPoint, MiniscriptError> {
        match self.jump_points.last() {
            Some(jp) if jp.keyword == keyword => Ok(self.jump_points.pop().unwrap()),
            _ => Err(MiniscriptError::compiler(format!(
                "'end {keyword}' without matching '{keyword}'"
            ))),
        }
    }

    /// Whether any emitted goto (or open jump point) targets this line.
    fn is_jump_target(&self, line_num: usize) -> bool {
        for line in self.code.borrow().iter() {
            if matches!(
                line.op,
                Op::GotoA | Op::GotoAifB | Op::GotoAifNotB | Op::GotoAifTrulyB
            ) && matches!(line.rhs_a, Value::Number(n) if n as usize == line_num)
            {
                return true;
            }
        }
        self.jump_points.iter().any(|jp| jp.line_num == line_num)
    }

    /// Patch the matching back-patch (and any "break"s after it, when
    /// requested) to just past the current code end.
    fn patch(
        &mut self,
        keyword_found: &str,
        also_break: bool,
        reserving_lines: usize,
    ) -> Result<(), MiniscriptError> {
        let target = Value::Number((self.code_len() + reserving_lines) as f64);
        let mut done = false;
        let mut idx = self.backpatches.len();
        while idx > 0 && !done {
            idx -= 1;
            let patch_it;
            if self.backpatches[idx].waiting_for == keyword_found {
                patch_it = true;
                done = true;
            } else if self.backpatches[idx].waiting_for == "break" {
                // always OK here; patched only when closing a loop
                patch_it = also_break;
            } else {
                return Err(MiniscriptError::compiler(format!(
                    "'{}' skips expected '{}'",
                    keyword_found, self.backpatches[idx].waiting_for
                )));
            }
            if patch_it {
                let line_num = self.backpatches[idx].line_num;
                self.code.borrow_mut()[line_num].rhs_a = target.clone();
                self.backpatches.remove(idx);
            }
        }
        if !done {
            return Err(MiniscriptError::compiler(format!(
                "'{keyword_found}' without matching block starter"
            )));
        }
        Ok(())
    }

    /// Patch up all the branches of a single open if block: the final
    /// "else" and one or more "end if" jumps, stopping at the special
    /// if:MARK sentinel that delimits the block.
    fn patch_if_block(&mut self) -> Result<(), MiniscriptError> {
        let target = Value::Number(self.code_len() as f64);
        let mut idx = self.backpatches.len();
        while idx > 0 {
            idx -= 1;
            match self.backpatches[idx].waiting_for.as_str() {
                "if:MARK" => {
                    self.backpatches.remove(idx);
                    return Ok(());
                }
                "end if" | "else" => {
                    let line_num = self.backpatches[idx].line_num;
                    self.code.borrow_mut()[line_num].rhs_a = target.clone();
                    self.backpatches.remove(idx);
                }
                "break" => {} // belongs to an enclosing loop
                _ => {
                    return Err(MiniscriptError::compiler("'end if' without matching 'if'"));
                }
            }
        }
        Err(MiniscriptError::compiler("'end if' without matching 'if'"))
    }
}

/// The parser: transforms tokens directly into TAC lines, with no AST in
/// between.  A stack of parse states tracks nested function literals;
/// the bottom state holds the global code.
pub struct Parser {
    /// Name of the file (etc.), used in error reporting.
    pub error_context: Option<String>,
    partial_input: String,
    output_stack: Vec<ParseState>,
    /// A parse state created for a `function` literal mid-statement; it
    /// is pushed onto the stack once the current statement finishes.
    pending_state: Option<ParseState>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            error_context: None,
            partial_input: String::new(),
            output_stack: vec![ParseState::new()],
            pending_state: None,
        }
    }

    /// Throw out all code and intermediate results.
    pub fn reset(&mut self) {
        self.output_stack.clear();
        self.output_stack.push(ParseState::new());
        self.partial_input.clear();
        self.pending_state = None;
    }

    /// Partially reset: abandon open blocks and partial input, but keep
    /// already-compiled code.  Used by the REPL to recover from errors.
    pub fn partial_reset(&mut self) {
        self.output_stack.truncate(1);
        let state = &mut self.output_stack[0];
        state.backpatches.clear();
        state.jump_points.clear();
        state.next_temp_num = 0;
        self.partial_input.clear();
        self.pending_state = None;
    }

    pub fn need_more_input(&self) -> bool {
        if !self.partial_input.is_empty() {
            return true;
        }
        if self.output_stack.len() > 1 {
            return true;
        }
        !self.output_stack[0].backpatches.is_empty()
    }

    /// Whether the source ends in a token that means the statement
    /// continues on the next line: a binary operator, open bracket,
    /// comma, dot, colon, or assignment.  A lexing failure is reported
    /// as "no" here, so parsing surfaces the real error.
    pub fn ends_with_line_continuation(source: &str) -> bool {
        match Lexer::last_token(source) {
            Err(_) => false,
            Ok(tok) => !matches!(
                tok.token_type,
                TokenType::Eol
                    | TokenType::Identifier
                    | TokenType::Keyword
                    | TokenType::Number
                    | TokenType::RCurly
                    | TokenType::RParen
                    | TokenType::RSquare
                    | TokenType::String
                    | TokenType::Unknown
            ),
        }
    }

    pub fn parse(&mut self, source: &str) -> Result<(), MiniscriptError> {
        self.parse_with_mode(source, false)
    }

    pub fn parse_with_mode(
        &mut self,
        source: &str,
        repl_mode: bool,
    ) -> Result<(), MiniscriptError> {
        if repl_mode && Self::ends_with_line_continuation(source) {
            // Hold the incomplete final line for the next call.
            self.partial_input.push_str(&Lexer::trim_comment(source));
            return Ok(());
        }
        let combined = format!("{}{}", self.partial_input, source);
        self.partial_input.clear();
        let mut tokens = Lexer::new(&combined);
        self.parse_multiple_lines(&mut tokens)?;

        if !repl_mode && self.need_more_input() {
            // We need more input but there is none.  Report PAST the
            // last line, making clear this is an end-of-file problem.
            let loc = SourceLoc::new(self.error_context.clone(), tokens.line_num + 1);
            if self.output_stack.len() > 1 {
                return Err(MiniscriptError::compiler(
                    "'function' without matching 'end function'",
                )
                .with_location(loc));
            }
            if let Some(bp) = self.output_stack[0].backpatches.last() {
                let msg = match bp.waiting_for.as_str() {
                    "end for" => "'for' without matching 'end for'",
                    "end if" | "else" | "if:MARK" => "'if' without matching 'end if'",
                    "end while" => "'while' without matching 'end while'",
                    _ => "unmatched block opener",
                };
                return Err(MiniscriptError::compiler(msg).with_location(loc));
            }
        }
        Ok(())
    }

    /// A machine loaded with the code parsed so far.  The global code
    /// block stays shared with this parser, so the REPL can keep
    /// appending to it.
    pub fn create_vm(&self, standard_output: Option<TextOutput>) -> Machine {
        Machine::new(Rc::clone(&self.output_stack[0].code), standard_output)
    }

    fn output(&mut self) -> &mut ParseState {
        self.output_stack.last_mut().unwrap()
    }

    fn next_temp_num(&mut self) -> usize {
        let state = self.output();
        let n = state.next_temp_num;
        state.next_temp_num += 1;
        n
    }

    fn next_temp(&mut self) -> Value {
        Value::temp(self.next_temp_num())
    }

    fn here(&self, tokens: &Lexer) -> SourceLoc {
        SourceLoc::new(self.error_context.clone(), tokens.line_num)
    }

    fn allow_line_break(&mut self, tokens: &mut Lexer) -> Result<(), MiniscriptError> {
        while tokens.peek()?.token_type == TokenType::Eol && !tokens.at_end() {
            tokens.dequeue()?;
        }
        Ok(())
    }

    fn parse_multiple_lines(&mut self, tokens: &mut Lexer) -> Result<(), MiniscriptError> {
        while !tokens.at_end() {
            if tokens.peek()?.token_type == TokenType::Eol {
                tokens.dequeue()?;
                continue;
            }

            let location = self.here(tokens);

            // Pop our context when we reach 'end function'.
            if tokens.peek()?.is_keyword("end function") {
                tokens.dequeue()?;
                if self.output_stack.len() > 1 {
                    self.output_stack.pop();
                } else {
                    return Err(MiniscriptError::compiler(
                        "'end function' without matching block starter",
                    )
                    .with_location(location));
                }
                continue;
            }

            let output_start = self.output().code_len();
            if let Err(e) = self.parse_statement(tokens, false) {
                return Err(if e.location().is_none() {
                    e.with_location(location)
                } else {
                    e
                });
            }
            // Stamp the location onto every line the statement emitted.
            let code = Rc::clone(&self.output().code);
            let mut code_mut = code.borrow_mut();
            for i in output_start..code_mut.len() {
                code_mut[i].location = Some(location.clone());
            }
        }
        Ok(())
    }

    fn parse_statement(
        &mut self,
        tokens: &mut Lexer,
        allow_extra: bool,
    ) -> Result<(), MiniscriptError> {
        let peeked = tokens.peek()?;
        if peeked.token_type == TokenType::Keyword
            && !matches!(peeked.text.as_str(), "not" | "true" | "false")
        {
            let keyword = tokens.dequeue()?.text;
            match keyword.as_str() {
                "return" => {
                    let mut return_value = Value::Null;
                    if tokens.peek()?.token_type != TokenType::Eol {
                        return_value = self.parse_expr(tokens)?;
                    }
                    self.output()
                        .add(Line::unary(Value::temp(0), Op::ReturnA, return_value));
                }
                "if" => {
                    let condition = self.parse_expr(tokens)?;
                    self.require_token(tokens, TokenType::Keyword, Some("then"))?;
                    // Emit a conditional branch whose target gets patched
                    // when the matching else / end if arrives.  The
                    // if:MARK sentinel delimits this block so the patch
                    // walk stops before eating outer patches.
                    self.output()
                        .add(Line::new(Value::Null, Op::GotoAifNotB, Value::Null, condition));
                    self.output().add_backpatch("if:MARK");
                    self.output().add_backpatch("else");

                    if tokens.peek()?.token_type != TokenType::Eol {
                        // Special single-line if: statements up to EOL,
                        // with an implicit end if.
                        self.parse_statement(tokens, true)?;
                        if tokens.peek()?.is_keyword("else") {
                            tokens.dequeue()?;
                            self.start_else_clause()?;
                            self.parse_statement(tokens, true)?;
                        } else {
                            self.require_either_token(
                                tokens,
                                TokenType::Keyword,
                                Some("else"),
                                TokenType::Eol,
                                None,
                            )?;
                        }
                        self.output().patch_if_block()?;
                    } else {
                        tokens.dequeue()?;
                    }
                    return Ok(());
                }
                "else" => self.start_else_clause()?,
                "else if" => {
                    self.start_else_clause()?;
                    let condition = self.parse_expr(tokens)?;
                    self.require_token(tokens, TokenType::Keyword, Some("then"))?;
                    self.output()
                        .add(Line::new(Value::Null, Op::GotoAifNotB, Value::Null, condition));
                    self.output().add_backpatch("else");
                }
                "end if" => {
                    // We might have an open else block or not, and
                    // multiple end-if jumps (one per else-if part).
                    self.output().patch_if_block()?;
                }
                "while" => {
                    // Note the current line so 'end while' can jump back.
                    self.output().add_jump_point("while");
                    let condition = self.parse_expr(tokens)?;
                    self.output()
                        .add(Line::new(Value::Null, Op::GotoAifNotB, Value::Null, condition));
                    self.output().add_backpatch("end while");
                }
                "end while" => {
                    let jump = self.output().close_jump_point("while")?;
                    self.output().add(Line::unary(
                        Value::Null,
                        Op::GotoA,
                        Value::Number(jump.line_num as f64),
                    ));
                    // Patch the loop condition's branch, and any breaks.
                    self.output().patch(&keyword, true, 0)?;
                }
                "for" => {
                    let loop_var_tok = self.require_token(tokens, TokenType::Identifier, None)?;
                    let loop_var = Value::var(&loop_var_tok.text);
                    self.require_token(tokens, TokenType::Keyword, Some("in"))?;
                    let stuff = self.parse_expr(tokens)?;
                    if stuff.is_null() {
                        return Err(MiniscriptError::compiler(
                            "sequence expression expected for 'for' loop",
                        )
                        .with_location(self.here(tokens)));
                    }

                    // Hidden index variable, initialized to -1; each
                    // iteration increments it and branches out when it
                    // passes the sequence length.
                    let idx_var = Value::var(format!("__{}_idx", loop_var_tok.text));
                    self.output()
                        .add(Line::unary(idx_var.clone(), Op::AssignA, Value::Number(-1.0)));
                    self.output().add_jump_point("for");
                    self.output().add(Line::new(
                        idx_var.clone(),
                        Op::APlusB,
                        idx_var.clone(),
                        Value::ONE,
                    ));
                    let size_of_seq = self.next_temp();
                    self.output()
                        .add(Line::unary(size_of_seq.clone(), Op::LengthOfA, stuff.clone()));
                    let is_too_big = self.next_temp();
                    self.output().add(Line::new(
                        is_too_big.clone(),
                        Op::AGreatOrEqualB,
                        idx_var.clone(),
                        size_of_seq,
                    ));
                    self.output()
                        .add(Line::new(Value::Null, Op::GotoAifB, Value::Null, is_too_big));
                    self.output().add_backpatch("end for");
                    self.output()
                        .add(Line::new(loop_var, Op::ElemBofIterA, stuff, idx_var));
                }
                "end for" => {
                    let jump = self.output().close_jump_point("for")?;
                    self.output().add(Line::unary(
                        Value::Null,
                        Op::GotoA,
                        Value::Number(jump.line_num as f64),
                    ));
                    self.output().patch(&keyword, true, 0)?;
                }
                "break" => {
                    // Jump to the end; patched when the loop closes.
                    self.output().add(Line::unary(Value::Null, Op::GotoA, Value::Null));
                    self.output().add_backpatch("break");
                }
                "continue" => {
                    if self.output().jump_points.is_empty() {
                        return Err(MiniscriptError::compiler(
                            "'continue' without open loop block",
                        )
                        .with_location(self.here(tokens)));
                    }
                    let line_num = self.output().jump_points.last().unwrap().line_num;
                    self.output().add(Line::unary(
                        Value::Null,
                        Op::GotoA,
                        Value::Number(line_num as f64),
                    ));
                }
                _ => {
                    return Err(MiniscriptError::compiler(format!(
                        "unexpected keyword '{keyword}' at start of line"
                    ))
                    .with_location(self.here(tokens)));
                }
            }
        } else {
            self.parse_assignment(tokens, allow_extra)?;
        }

        // A statement consumes everything to the end of the line.
        if !allow_extra {
            self.require_token(tokens, TokenType::Eol, None)?;
        }

        // If a function() literal opened a pending state, push it now
        // that the statement is finished.
        if let Some(pending) = self.pending_state.take() {
            self.output_stack.push(pending);
        }
        Ok(())
    }

    /// A function literal inside a map or list literal: its body is
    /// supplied by the following lines, so parse statements into the
    /// pending state until the matching `end function`, then resume the
    /// literal.
    fn finish_pending_function(&mut self, tokens: &mut Lexer) -> Result<(), MiniscriptError> {
        if self.pending_state.is_none() || tokens.peek()?.token_type != TokenType::Eol {
            return Ok(());
        }
        let entry_depth = self.output_stack.len();
        self.output_stack.push(self.pending_state.take().unwrap());
        while self.output_stack.len() > entry_depth {
            if tokens.at_end() {
                return Err(MiniscriptError::compiler(
                    "'function' without matching 'end function'",
                )
                .with_location(self.here(tokens)));
            }
            if tokens.peek()?.token_type == TokenType::Eol {
                tokens.dequeue()?;
                continue;
            }
            let location = self.here(tokens);
            if tokens.peek()?.is_keyword("end function") {
                tokens.dequeue()?;
                self.output_stack.pop();
                continue;
            }
            let output_start = self.output().code_len();
            if let Err(e) = self.parse_statement(tokens, false) {
                return Err(if e.location().is_none() {
                    e.with_location(location)
                } else {
                    e
                });
            }
            let code = Rc::clone(&self.output().code);
            let mut code_mut = code.borrow_mut();
            for i in output_start..code_mut.len() {
                code_mut[i].location = Some(location.clone());
            }
        }
        Ok(())
    }

    fn start_else_clause(&mut self) -> Result<(), MiniscriptError> {
        // Jump from the end of the if-body over the else block (target
        // patched at end if); then patch the open if-branch to here.
        self.output().add(Line::unary(Value::Null, Op::GotoA, Value::Null));
        self.output().patch("else", false, 0)?;
        self.output().add_backpatch("end if");
        Ok(())
    }

    fn parse_assignment(
        &mut self,
        tokens: &mut Lexer,
        _allow_extra: bool,
    ) -> Result<(), MiniscriptError> {
        let expr = self.parse_expr_full(tokens, true, true)?;
        let peek = tokens.peek()?;

        if peek.token_type == TokenType::Eol || peek.is_keyword("else") {
            // No explicit assignment; store an implicit result.
            let rhs = self.fully_evaluate(expr);
            self.output().add(Line::unary(Value::Null, Op::AssignImplicit, rhs));
            return Ok(());
        }

        if peek.token_type == TokenType::OpAssign {
            tokens.dequeue()?;
            let lhs = expr;
            let rhs = self.parse_expr(tokens)?;

            // If the last line assigns a temp that is exactly our rhs,
            // patch its destination to the lhs instead -- unless a jump
            // targets the next line (short-circuit evaluation).
            if let Value::Temp(rhs_num) = rhs {
                let len = self.output().code_len();
                if len > 0 && !self.output().is_jump_target(len) {
                    let code = Rc::clone(&self.output().code);
                    let mut code_mut = code.borrow_mut();
                    let last = code_mut.last_mut().unwrap();
                    if matches!(last.lhs, Value::Temp(n) if n == rhs_num) {
                        last.lhs = lhs;
                        return Ok(());
                    }
                }
            }

            // If the last line created and bound a function, update that
            // line's destination rather than adding a second assignment.
            if matches!(rhs, Value::Function(_)) && self.output().code_len() > 0 {
                let code = Rc::clone(&self.output().code);
                let mut code_mut = code.borrow_mut();
                let last = code_mut.last_mut().unwrap();
                if last.op == Op::BindAssignA {
                    last.lhs = lhs;
                    return Ok(());
                }
            }

            self.output().add(Line::unary(lhs, Op::AssignA, rhs));
            return Ok(());
        }

        // Otherwise this is a command statement: parse the rest of the
        // line as arguments to a function call.
        let func_ref = expr;
        let mut arg_count = 0usize;
        loop {
            let arg = self.parse_expr(tokens)?;
            self.output().add(Line::unary(Value::Null, Op::PushParam, arg));
            arg_count += 1;
            let p = tokens.peek()?;
            if p.token_type == TokenType::Eol {
                break;
            }
            if p.is_keyword("else") {
                break;
            }
            if p.token_type == TokenType::Comma {
                tokens.dequeue()?;
                self.allow_line_break(tokens)?;
                continue;
            }
            if self
                .require_either_token(tokens, TokenType::Comma, None, TokenType::Eol, None)?
                .token_type
                == TokenType::Eol
            {
                break;
            }
        }
        let result = self.next_temp();
        self.output().add(Line::new(
            result.clone(),
            Op::CallFunctionA,
            func_ref,
            Value::Number(arg_count as f64),
        ));
        self.output().add(Line::unary(Value::Null, Op::AssignImplicit, result));
        Ok(())
    }

    fn parse_expr(&mut self, tokens: &mut Lexer) -> Result<Value, MiniscriptError> {
        self.parse_expr_full(tokens, false, false)
    }

    fn parse_expr_full(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        self.parse_function(tokens, as_lval, statement_start)
    }

    fn parse_function(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if !tokens.peek()?.is_keyword("function") {
            return self.parse_or(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;

        let mut parameters = Vec::new();
        if tokens.peek()?.token_type != TokenType::Eol {
            self.require_token(tokens, TokenType::LParen, None)?;
            while tokens.peek()?.token_type != TokenType::RParen {
                // a parameter: identifier, or identifier = default
                let id = tokens.dequeue()?;
                if id.token_type != TokenType::Identifier {
                    return Err(MiniscriptError::compiler(format!(
                        "got {id} where an identifier is required"
                    ))
                    .with_location(self.here(tokens)));
                }
                let mut default_value = Value::Null;
                if tokens.peek()?.token_type == TokenType::OpAssign {
                    tokens.dequeue()?;
                    default_value = self.parse_expr(tokens)?;
                }
                parameters.push(Param::new(id.text, default_value));
                if tokens.peek()?.token_type == TokenType::RParen {
                    break;
                }
                self.require_token(tokens, TokenType::Comma, None)?;
            }
            self.require_token(tokens, TokenType::RParen, None)?;
        }

        // The function body is compiled into its own parse state, but we
        // can't push it yet: the current statement is still being
        // parsed.  It goes onto the stack when the statement ends.
        if self.pending_state.is_some() {
            return Err(MiniscriptError::compiler(
                "can't start two functions in one statement",
            )
            .with_location(self.here(tokens)));
        }
        let mut pending = ParseState::new();
        pending.next_temp_num = 1; // temp 0 holds the return value
        let func = Rc::new(FuncDef {
            parameters,
            code: Rc::clone(&pending.code),
        });
        self.pending_state = Some(pending);

        let val_func = Value::function(func);
        self.output()
            .add(Line::unary(Value::Null, Op::BindAssignA, val_func.clone()));
        Ok(val_func)
    }

    fn parse_or(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_and(tokens, as_lval, statement_start)?;
        let mut jump_lines: Vec<usize> = Vec::new();
        while tokens.peek()?.is_keyword("or") {
            tokens.dequeue()?;
            val = self.fully_evaluate(val);
            self.allow_line_break(tokens)?;

            // Short-circuit jump on the value so far.  The usual
            // GotoAifB would break intermediate fuzzy truth: we must
            // jump only if the value is absolutely true.
            let jump_idx = self.output().code_len();
            self.output()
                .add(Line::new(Value::Null, Op::GotoAifTrulyB, Value::Null, val.clone()));
            jump_lines.push(jump_idx);

            let op_b = self.parse_and(tokens, false, false)?;
            let temp = self.next_temp();
            self.output().add(Line::new(temp.clone(), Op::AOrB, val, op_b));
            val = temp;
        }

        if !jump_lines.is_empty() {
            // Short-circuit jumps land on a line writing the constant 1
            // into our output temp; everything else skips over it.
            let len = self.output().code_len();
            self.output().add(Line::unary(
                Value::Null,
                Op::GotoA,
                Value::Number((len + 2) as f64),
            ));
            self.output()
                .add(Line::unary(val.clone(), Op::AssignA, Value::ONE));
            let target = Value::Number((self.output().code_len() - 1) as f64);
            let code = Rc::clone(&self.output().code);
            let mut code_mut = code.borrow_mut();
            for idx in jump_lines {
                code_mut[idx].rhs_a = target.clone();
            }
        }
        Ok(val)
    }

    fn parse_and(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_not(tokens, as_lval, statement_start)?;
        let mut jump_lines: Vec<usize> = Vec::new();
        while tokens.peek()?.is_keyword("and") {
            tokens.dequeue()?;
            val = self.fully_evaluate(val);
            self.allow_line_break(tokens)?;

            let jump_idx = self.output().code_len();
            self.output()
                .add(Line::new(Value::Null, Op::GotoAifNotB, Value::Null, val.clone()));
            jump_lines.push(jump_idx);

            let op_b = self.parse_not(tokens, false, false)?;
            let temp = self.next_temp();
            self.output().add(Line::new(temp.clone(), Op::AAndB, val, op_b));
            val = temp;
        }

        if !jump_lines.is_empty() {
            let len = self.output().code_len();
            self.output().add(Line::unary(
                Value::Null,
                Op::GotoA,
                Value::Number((len + 2) as f64),
            ));
            self.output()
                .add(Line::unary(val.clone(), Op::AssignA, Value::ZERO));
            let target = Value::Number((self.output().code_len() - 1) as f64);
            let code = Rc::clone(&self.output().code);
            let mut code_mut = code.borrow_mut();
            for idx in jump_lines {
                code_mut[idx].rhs_a = target.clone();
            }
        }
        Ok(val)
    }

    fn parse_not(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if tokens.peek()?.is_keyword("not") {
            tokens.dequeue()?;
            self.allow_line_break(tokens)?;
            let val = self.parse_is_a(tokens, false, false)?;
            let temp = self.next_temp();
            self.output().add(Line::unary(temp.clone(), Op::NotA, val));
            Ok(temp)
        } else {
            self.parse_is_a(tokens, as_lval, statement_start)
        }
    }

    fn parse_is_a(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_comparisons(tokens, as_lval, statement_start)?;
        if tokens.peek()?.is_keyword("isa") {
            tokens.dequeue()?;
            self.allow_line_break(tokens)?;
            val = self.fully_evaluate(val);
            let op_b = self.parse_comparisons(tokens, false, false)?;
            let temp = self.next_temp();
            self.output().add(Line::new(temp.clone(), Op::AisaB, val, op_b));
            val = temp;
        }
        Ok(val)
    }

    fn parse_comparisons(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_add_sub(tokens, as_lval, statement_start)?;
        let mut op_a = val.clone();
        let mut opcode = comparison_op(tokens.peek()?.token_type);
        // A chain of comparisons multiplies together, so every link must
        // hold for the whole expression to be true.
        let mut first_comparison = true;
        while let Some(op) = opcode {
            tokens.dequeue()?;
            op_a = self.fully_evaluate(op_a);
            self.allow_line_break(tokens)?;

            let op_b = self.parse_add_sub(tokens, false, false)?;
            let mut temp_num = self.next_temp_num();
            self.output()
                .add(Line::new(Value::temp(temp_num), op, op_a.clone(), op_b.clone()));
            if first_comparison {
                first_comparison = false;
            } else {
                let prev = temp_num;
                temp_num = self.next_temp_num();
                self.output().add(Line::new(
                    Value::temp(temp_num),
                    Op::ATimesB,
                    val,
                    Value::temp(prev),
                ));
            }
            val = Value::temp(temp_num);
            op_a = op_b;
            opcode = comparison_op(tokens.peek()?.token_type);
        }
        Ok(val)
    }

    fn parse_add_sub(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_mult_div(tokens, as_lval, statement_start)?;
        let mut tok = tokens.peek()?;
        while tok.token_type == TokenType::OpPlus
            || (tok.token_type == TokenType::OpMinus
                && (!statement_start || !tok.after_space || tokens.is_at_whitespace()))
        {
            tokens.dequeue()?;
            self.allow_line_break(tokens)?;

            val = self.fully_evaluate(val);
            let op_b = self.parse_mult_div(tokens, false, false)?;
            let temp = self.next_temp();
            let op = if tok.token_type == TokenType::OpPlus {
                Op::APlusB
            } else {
                Op::AMinusB
            };
            self.output().add(Line::new(temp.clone(), op, val, op_b));
            val = temp;
            tok = tokens.peek()?;
        }
        Ok(val)
    }

    fn parse_mult_div(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_unary_minus(tokens, as_lval, statement_start)?;
        let mut tok = tokens.peek()?;
        while matches!(
            tok.token_type,
            TokenType::OpTimes | TokenType::OpDivide | TokenType::OpMod
        ) {
            tokens.dequeue()?;
            self.allow_line_break(tokens)?;

            val = self.fully_evaluate(val);
            let op_b = self.parse_unary_minus(tokens, false, false)?;
            let temp = self.next_temp();
            let op = match tok.token_type {
                TokenType::OpTimes => Op::ATimesB,
                TokenType::OpDivide => Op::ADividedByB,
                _ => Op::AModB,
            };
            self.output().add(Line::new(temp.clone(), op, val, op_b));
            val = temp;
            tok = tokens.peek()?;
        }
        Ok(val)
    }

    fn parse_unary_minus(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if tokens.peek()?.token_type != TokenType::OpMinus {
            return self.parse_new(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;
        self.allow_line_break(tokens)?;

        let val = self.parse_new(tokens, false, false)?;
        if let Value::Number(n) = val {
            // a numeric literal follows: just invert it and be done
            return Ok(Value::Number(-n));
        }
        let temp = self.next_temp();
        self.output()
            .add(Line::new(temp.clone(), Op::AMinusB, Value::ZERO, val));
        Ok(temp)
    }

    fn parse_new(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if !tokens.peek()?.is_keyword("new") {
            return self.parse_address_of(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;
        self.allow_line_break(tokens)?;

        // Grab a reference to our __isa value, and build a fresh map
        // with it.  The map must be created at runtime, not at parse
        // time -- each execution needs a distinct instance -- hence
        // CopyA rather than AssignA.
        let isa = self.parse_address_of(tokens, false, false)?;
        let map = ValMap::new_rc();
        map.set(ISA_KEY, isa);
        let result = self.next_temp();
        self.output()
            .add(Line::unary(result.clone(), Op::CopyA, Value::Map(map)));
        Ok(result)
    }

    fn parse_address_of(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if tokens.peek()?.token_type != TokenType::AddressOf {
            return self.parse_power(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;
        self.allow_line_break(tokens)?;
        let val = self.parse_power(tokens, true, statement_start)?;
        Ok(match val {
            Value::Var { name, .. } => Value::Var {
                name,
                no_invoke: true,
            },
            Value::SeqElem(se) => Value::SeqElem(Rc::new(SeqElem {
                sequence: se.sequence.clone(),
                index: se.index.clone(),
                no_invoke: true,
            })),
            other => other,
        })
    }

    fn parse_power(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_call_expr(tokens, as_lval, statement_start)?;
        while tokens.peek()?.token_type == TokenType::OpPower {
            tokens.dequeue()?;
            self.allow_line_break(tokens)?;

            val = self.fully_evaluate(val);
            let op_b = self.parse_call_expr(tokens, false, false)?;
            let temp = self.next_temp();
            self.output().add(Line::new(temp.clone(), Op::APowB, val, op_b));
            val = temp;
        }
        Ok(val)
    }

    /// A variable or sequence lookup appearing as a value gets invoked
    /// with zero arguments -- this is how parameterless functions are
    /// called by name.  @-protected references, `self` and `super` are
    /// left raw for runtime handling.
    fn fully_evaluate(&mut self, val: Value) -> Value {
        match &val {
            Value::Var { name, no_invoke } => {
                if *no_invoke || &**name == "super" || &**name == "self" {
                    return val;
                }
                let temp = self.next_temp();
                self.output()
                    .add(Line::new(temp.clone(), Op::CallFunctionA, val, Value::ZERO));
                temp
            }
            Value::SeqElem(se) => {
                if se.no_invoke {
                    return val;
                }
                let temp = self.next_temp();
                self.output()
                    .add(Line::new(temp.clone(), Op::CallFunctionA, val, Value::ZERO));
                temp
            }
            _ => val,
        }
    }

    fn parse_call_expr(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let mut val = self.parse_map(tokens, as_lval, statement_start)?;
        loop {
            let peeked = tokens.peek()?;
            if peeked.token_type == TokenType::Dot {
                tokens.dequeue()?;
                self.allow_line_break(tokens)?;
                let next_ident = self.require_token(tokens, TokenType::Identifier, None)?;
                // Chaining: look up (by invoking) the previous part of
                // the sequence, then build on it.
                val = self.fully_evaluate(val);
                val = Value::seq_elem(val, Value::string(&next_ident.text));
                let p = tokens.peek()?;
                if p.token_type == TokenType::LParen && !p.after_space {
                    // Followed by parens: parse as a call right away.
                    val = self.parse_call_args(val, tokens)?;
                }
            } else if peeked.token_type == TokenType::LSquare && !peeked.after_space {
                tokens.dequeue()?;
                self.allow_line_break(tokens)?;
                val = self.fully_evaluate(val);

                if tokens.peek()?.token_type == TokenType::Colon {
                    // e.g. foo[:4]
                    tokens.dequeue()?;
                    self.allow_line_break(tokens)?;
                    let mut index2 = Value::Null;
                    if tokens.peek()?.token_type != TokenType::RSquare {
                        index2 = self.parse_expr(tokens)?;
                    }
                    let temp_num = self.next_temp_num();
                    let code = Rc::clone(&self.output().code);
                    compile_slice(&mut code.borrow_mut(), val, Value::Null, index2, temp_num);
                    val = Value::temp(temp_num);
                } else {
                    let index = self.parse_expr(tokens)?;
                    if tokens.peek()?.token_type == TokenType::Colon {
                        // e.g. foo[2:4] or foo[2:]
                        tokens.dequeue()?;
                        self.allow_line_break(tokens)?;
                        let mut index2 = Value::Null;
                        if tokens.peek()?.token_type != TokenType::RSquare {
                            index2 = self.parse_expr(tokens)?;
                        }
                        let temp_num = self.next_temp_num();
                        let code = Rc::clone(&self.output().code);
                        compile_slice(&mut code.borrow_mut(), val, index, index2, temp_num);
                        val = Value::temp(temp_num);
                    } else if statement_start {
                        // At statement start, don't compile the last
                        // lookup yet: it may become an assignment
                        // target.  But compile any previous one.
                        if let Value::SeqElem(se) = &val {
                            let temp = self.next_temp();
                            self.output().add(Line::new(
                                temp.clone(),
                                Op::ElemBofA,
                                se.sequence.clone(),
                                se.index.clone(),
                            ));
                            val = temp;
                        }
                        val = Value::seq_elem(val, index);
                    } else {
                        let temp = self.next_temp();
                        self.output()
                            .add(Line::new(temp.clone(), Op::ElemBofA, val, index));
                        val = temp;
                    }
                }
                self.require_token(tokens, TokenType::RSquare, None)?;
            } else if matches!(&val, Value::Var { no_invoke: false, .. })
                || matches!(&val, Value::SeqElem(_))
            {
                // A variable... which might refer to a function.  With
                // parens it's definitely a call; without, call it anyway
                // unless an lvalue is needed.
                let p = tokens.peek()?;
                if !as_lval || (p.token_type == TokenType::LParen && !p.after_space) {
                    val = self.parse_call_args(val, tokens)?;
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(val)
    }

    fn parse_map(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if tokens.peek()?.token_type != TokenType::LCurly {
            return self.parse_list(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;
        // A map literal must produce a distinct object on each
        // execution, so it is emitted through CopyA.
        let map = ValMap::new_rc();
        if tokens.peek()?.token_type == TokenType::RCurly {
            tokens.dequeue()?;
        } else {
            loop {
                self.allow_line_break(tokens)?;

                // allow the map to close with a } on its own line
                if tokens.peek()?.token_type == TokenType::RCurly {
                    tokens.dequeue()?;
                    break;
                }

                // A bare identifier key is taken as a string key, the
                // way maps are nearly always written; parenthesize to
                // key by a variable's value instead.
                let key = match self.parse_expr_full(tokens, true, false)? {
                    Value::Var { name, .. } => Value::string(&*name),
                    other => other,
                };
                self.require_token(tokens, TokenType::Colon, None)?;
                self.allow_line_break(tokens)?;
                let value = self.parse_expr(tokens)?;
                self.finish_pending_function(tokens)?;
                map.insert(key, value);

                if self
                    .require_either_token(tokens, TokenType::Comma, None, TokenType::RCurly, None)?
                    .token_type
                    == TokenType::RCurly
                {
                    break;
                }
            }
        }
        let result = self.next_temp();
        self.output()
            .add(Line::unary(result.clone(), Op::CopyA, Value::Map(map)));
        Ok(result)
    }

    fn parse_list(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if tokens.peek()?.token_type != TokenType::LSquare {
            return self.parse_quantity(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;
        let mut elements = Vec::new();
        if tokens.peek()?.token_type == TokenType::RSquare {
            tokens.dequeue()?;
        } else {
            loop {
                self.allow_line_break(tokens)?;

                // allow the list to close with a ] on its own line
                if tokens.peek()?.token_type == TokenType::RSquare {
                    tokens.dequeue()?;
                    break;
                }

                let elem = self.parse_expr(tokens)?;
                self.finish_pending_function(tokens)?;
                elements.push(elem);
                if self
                    .require_either_token(tokens, TokenType::Comma, None, TokenType::RSquare, None)?
                    .token_type
                    == TokenType::RSquare
                {
                    break;
                }
            }
        }
        let list = Value::list(elements);
        if statement_start {
            // return the list as-is for indexed assignment (foo[3]=42)
            return Ok(list);
        }
        let result = self.next_temp();
        self.output()
            .add(Line::unary(result.clone(), Op::CopyA, list));
        Ok(result)
    }

    fn parse_quantity(
        &mut self,
        tokens: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        if tokens.peek()?.token_type != TokenType::LParen {
            return self.parse_atom(tokens, as_lval, statement_start);
        }
        tokens.dequeue()?;
        self.allow_line_break(tokens)?;
        let val = self.parse_expr(tokens)?;
        self.require_token(tokens, TokenType::RParen, None)?;
        Ok(val)
    }

    /// Gather call arguments (emitting PushParam for each) and the call
    /// itself.  Works both with parenthesized arguments and without
    /// parens (a bare zero-argument call).
    fn parse_call_args(
        &mut self,
        func_ref: Value,
        tokens: &mut Lexer,
    ) -> Result<Value, MiniscriptError> {
        let mut arg_count = 0usize;
        if tokens.peek()?.token_type == TokenType::LParen {
            tokens.dequeue()?;
            if tokens.peek()?.token_type == TokenType::RParen {
                tokens.dequeue()?;
            } else {
                loop {
                    self.allow_line_break(tokens)?;
                    let arg = self.parse_expr(tokens)?;
                    self.output().add(Line::unary(Value::Null, Op::PushParam, arg));
                    arg_count += 1;
                    if self
                        .require_either_token(
                            tokens,
                            TokenType::Comma,
                            None,
                            TokenType::RParen,
                            None,
                        )?
                        .token_type
                        == TokenType::RParen
                    {
                        break;
                    }
                }
            }
        }
        let result = self.next_temp();
        self.output().add(Line::new(
            result.clone(),
            Op::CallFunctionA,
            func_ref,
            Value::Number(arg_count as f64),
        ));
        Ok(result)
    }

    fn parse_atom(
        &mut self,
        tokens: &mut Lexer,
        _as_lval: bool,
        _statement_start: bool,
    ) -> Result<Value, MiniscriptError> {
        let tok = if tokens.at_end() {
            Token::eol()
        } else {
            tokens.dequeue()?
        };
        match tok.token_type {
            TokenType::Number => tok.text.parse::<f64>().map(Value::Number).map_err(|_| {
                MiniscriptError::compiler(format!("invalid numeric literal: {}", tok.text))
            }),
            TokenType::String => Ok(Value::string(&tok.text)),
            TokenType::Identifier => Ok(Value::var(&tok.text)),
            TokenType::Keyword => match tok.text.as_str() {
                "null" => Ok(Value::Null),
                "true" => Ok(Value::ONE),
                "false" => Ok(Value::ZERO),
                _ => Err(MiniscriptError::compiler(format!(
                    "got {tok} where number, string, or identifier is required"
                ))),
            },
            _ => Err(MiniscriptError::compiler(format!(
                "got {tok} where number, string, or identifier is required"
            ))),
        }
    }

    /// Consume the next token; it must match the given type (and text,
    /// when supplied).
    fn require_token(
        &mut self,
        tokens: &mut Lexer,
        token_type: TokenType,
        text: Option<&str>,
    ) -> Result<Token, MiniscriptError> {
        let got = if tokens.at_end() {
            Token::eol()
        } else {
            tokens.dequeue()?
        };
        if got.token_type != token_type || text.is_some_and(|t| got.text != t) {
            let expected = Token::new(token_type, text.unwrap_or(""));
            return Err(MiniscriptError::compiler(format!(
                "got {got} where {expected} is required"
            ))
            .with_location(self.here(tokens)));
        }
        Ok(got)
    }

    fn require_either_token(
        &mut self,
        tokens: &mut Lexer,
        type1: TokenType,
        text1: Option<&str>,
        type2: TokenType,
        text2: Option<&str>,
    ) -> Result<Token, MiniscriptError> {
        let got = if tokens.at_end() {
            Token::eol()
        } else {
            tokens.dequeue()?
        };
        let type_mismatch = got.token_type != type1 && got.token_type != type2;
        let text_mismatch = text1.is_some_and(|t| got.text != t)
            && text2.is_some_and(|t| got.text != t);
        if type_mismatch || text_mismatch {
            let expected1 = Token::new(type1, text1.unwrap_or(""));
            let expected2 = Token::new(type2, text2.unwrap_or(""));
            return Err(MiniscriptError::compiler(format!(
                "got {got} where {expected1} or {expected2} is required"
            ))
            .with_location(self.here(tokens)));
        }
        Ok(got)
    }
}

fn comparison_op(token_type: TokenType) -> Option<Op> {
    match token_type {
        TokenType::OpEqual => Some(Op::AEqualB),
        TokenType::OpNotEqual => Some(Op::ANotEqualB),
        TokenType::OpGreater => Some(Op::AGreaterThanB),
        TokenType::OpGreatEqual => Some(Op::AGreatOrEqualB),
        TokenType::OpLesser => Some(Op::ALessThanB),
        TokenType::OpLessEqual => Some(Op::ALessOrEqualB),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Parser {
        let mut parser = Parser::new();
        parser.parse(src).unwrap_or_else(|e| {
            panic!("{} while parsing:\n{src}", e.description());
        });
        parser
    }

    fn parse_err(src: &str) -> MiniscriptError {
        let mut parser = Parser::new();
        parser.parse(src).expect_err("expected a parse failure")
    }

    fn global_code(parser: &Parser) -> Vec<Line> {
        parser.output_stack[0].code.borrow().clone()
    }

    #[test]
    fn valid_parses() {
        // the classics
        parse_ok("pi < 4");
        parse_ok("(pi < 4)");
        parse_ok("if true then 20 else 30");
        parse_ok("f = function(x)\nreturn x*3\nend function\nf(14)");
        parse_ok("foo=\"bar\"\nindexes(foo*2)\nfoo.indexes");
        parse_ok("x=[]\nx.push(42)");
        parse_ok("list1=[10, 20, 30, 40, 50]; range(0, list1.len)");
        parse_ok("f = function(x); print(\"foo\"); end function; print(false and f)");
        parse_ok("print 42");
        parse_ok("print true");
        parse_ok("f = function(x)\nprint x\nend function\nf 42");
        parse_ok("myList = [1, null, 3]");
        parse_ok("while true; if true then; break; else; print 1; end if; end while");
        parse_ok("x = 0 or\n1");
        parse_ok("x = [1, 2, \n 3]");
        parse_ok("range 1,\n10, 2");
    }

    #[test]
    fn simple_assignment_optimization() {
        // x = 3 + 4 should patch the APlusB destination, not emit a
        // separate AssignA.
        let parser = parse_ok("x = 3 + 4");
        let code = global_code(&parser);
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Op::APlusB);
        assert!(matches!(&code[0].lhs, Value::Var { name, .. } if &**name == "x"));
    }

    #[test]
    fn function_literal_binds_into_assignment() {
        let parser = parse_ok("f = function(x)\nreturn x\nend function");
        let code = global_code(&parser);
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Op::BindAssignA);
        assert!(matches!(&code[0].lhs, Value::Var { name, .. } if &**name == "f"));
        let func = match &code[0].rhs_a {
            Value::Function(f) => Rc::clone(&f.func),
            other => panic!("expected function, got {other:?}"),
        };
        assert_eq!(func.parameters.len(), 1);
        assert_eq!(func.parameters[0].name, "x");
        assert_eq!(func.code.borrow().len(), 1);
        assert_eq!(func.code.borrow()[0].op, Op::ReturnA);
    }

    #[test]
    fn for_loop_lowering_shape() {
        let parser = parse_ok("for v in [1,2]\nend for");
        let code = global_code(&parser);
        let ops: Vec<Op> = code.iter().map(|l| l.op).collect();
        assert_eq!(
            ops,
            [
                Op::CopyA,          // the list literal
                Op::AssignA,        // __v_idx := -1
                Op::APlusB,         // __v_idx += 1
                Op::LengthOfA,
                Op::AGreatOrEqualB,
                Op::GotoAifB,       // exit when index too big
                Op::ElemBofIterA,   // v := seq iter idx
                Op::GotoA,          // back to the top
            ]
        );
        // the exit branch targets just past the loop
        assert_eq!(code[5].rhs_a.int_value(), code.len() as i64);
        // the back jump targets the increment line
        assert_eq!(code[7].rhs_a.int_value(), 2);
    }

    #[test]
    fn short_circuit_and_shape() {
        let parser = parse_ok("x = true and false");
        let code = global_code(&parser);
        let ops: Vec<Op> = code.iter().map(|l| l.op).collect();
        // The tail GotoA targets the line after the constant write,
        // which makes that line a jump target -- so the assignment
        // optimization must NOT fire, and a separate AssignA lands x.
        assert_eq!(
            ops,
            [Op::GotoAifNotB, Op::AAndB, Op::GotoA, Op::AssignA, Op::AssignA]
        );
        // the short-circuit jump lands on the constant-write line
        assert_eq!(code[0].rhs_a.int_value(), 3);
        // which writes 0 into the result temp
        assert_eq!(code[3].rhs_a.double_value(), 0.0);
        assert!(matches!(&code[4].lhs, Value::Var { name, .. } if &**name == "x"));
    }

    #[test]
    fn mismatched_blocks_fail() {
        parse_err("end if");
        parse_err("end while");
        parse_err("end for");
        parse_err("end function");
        parse_err("while true\nend for");
        parse_err("continue");
        parse_err("if true then\nprint 1");
        parse_err("f = function()\nreturn");
        parse_err("foo = ");
    }

    #[test]
    fn break_patches_to_loop_end() {
        let parser = parse_ok("while true\nbreak\nend while");
        let code = global_code(&parser);
        // break is the unconditional goto in the middle
        let break_line = code
            .iter()
            .find(|l| l.op == Op::GotoA && l.rhs_a.int_value() == code.len() as i64)
            .expect("break should target past the loop");
        assert_eq!(break_line.op, Op::GotoA);
    }

    #[test]
    fn unary_minus_folds_literals() {
        let parser = parse_ok("x = -5");
        let code = global_code(&parser);
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Op::AssignA);
        assert_eq!(code[0].rhs_a.double_value(), -5.0);
    }

    #[test]
    fn address_of_suppresses_call() {
        let parser = parse_ok("f = @floor");
        let code = global_code(&parser);
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Op::AssignA);
        assert!(matches!(&code[0].rhs_a, Value::Var { no_invoke: true, .. }));
    }

    #[test]
    fn bare_identifier_gets_auto_called() {
        let parser = parse_ok("x = foo");
        let code = global_code(&parser);
        assert_eq!(code[0].op, Op::CallFunctionA);
        assert_eq!(code[0].rhs_b.double_value(), 0.0);
    }

    #[test]
    fn slice_compiles_to_intrinsic_call() {
        let parser = parse_ok("x = [1,2,3][1:2]");
        let code = global_code(&parser);
        let ops: Vec<Op> = code.iter().map(|l| l.op).collect();
        assert_eq!(
            ops,
            [
                Op::CopyA,
                Op::PushParam,
                Op::PushParam,
                Op::PushParam,
                Op::CallFunctionA,
            ]
        );
    }

    #[test]
    fn new_compiles_to_copy_of_isa_map() {
        let parser = parse_ok("a = {}\nb = new a");
        let code = global_code(&parser);
        let copy = code.last().unwrap();
        assert_eq!(copy.op, Op::CopyA);
        let map = copy.rhs_a.as_map().expect("CopyA of a map literal");
        assert!(map.contains_str_key(ISA_KEY));
    }

    #[test]
    fn map_literal_identifier_keys_become_strings() {
        let parser = parse_ok("d = {greet: 1}");
        let code = global_code(&parser);
        let map = code[0].rhs_a.as_map().expect("CopyA of a map literal");
        assert!(map.contains_str_key("greet"));
    }

    #[test]
    fn map_literal_function_value_parses_inline_body() {
        let parser = parse_ok("d = {greet: function()\nreturn 1\nend function}\nx = 2");
        let code = global_code(&parser);
        // statement after the literal still lands in the global code
        assert_eq!(code.last().unwrap().op, Op::AssignA);
        let copy = &code[code.len() - 2];
        assert_eq!(copy.op, Op::CopyA);
        let map = copy.rhs_a.as_map().unwrap();
        let func = map.get("greet").unwrap();
        let func = func.as_function().unwrap();
        assert_eq!(func.func.code.borrow().len(), 1);
    }

    #[test]
    fn repl_mode_buffers_line_continuations() {
        let mut parser = Parser::new();
        parser.parse_with_mode("x = 1 +", true).unwrap();
        assert!(parser.need_more_input());
        parser.parse_with_mode("2", true).unwrap();
        assert!(!parser.need_more_input());
        let code = global_code(&parser);
        assert_eq!(code.last().unwrap().op, Op::APlusB);
    }

    #[test]
    fn need_more_input_tracks_open_blocks() {
        let mut parser = Parser::new();
        parser.parse_with_mode("while true", true).unwrap();
        assert!(parser.need_more_input());
        parser.parse_with_mode("end while", true).unwrap();
        assert!(!parser.need_more_input());

        parser.parse_with_mode("f = function()", true).unwrap();
        assert!(parser.need_more_input());
        parser.parse_with_mode("end function", true).unwrap();
        assert!(!parser.need_more_input());
    }

    #[test]
    fn partial_reset_recovers_but_keeps_code() {
        let mut parser = Parser::new();
        parser.parse_with_mode("x = 9", true).unwrap();
        let before = global_code(&parser).len();
        parser.parse_with_mode("while true", true).unwrap();
        assert!(parser.need_more_input());
        parser.partial_reset();
        assert!(!parser.need_more_input());
        assert!(global_code(&parser).len() >= before);
    }

    #[test]
    fn line_continuation_detection() {
        assert!(Parser::ends_with_line_continuation("x = 1 +"));
        assert!(Parser::ends_with_line_continuation("x = ["));
        assert!(Parser::ends_with_line_continuation("f 1,"));
        assert!(Parser::ends_with_line_continuation("x ="));
        assert!(!Parser::ends_with_line_continuation("x = 1"));
        assert!(!Parser::ends_with_line_continuation("x = foo"));
        assert!(!Parser::ends_with_line_continuation("x = \"s\""));
        // lexer failure: let the parser report it
        assert!(!Parser::ends_with_line_continuation("x = \"unterminated"));
    }

    #[test]
    fn statement_location_is_recorded() {
        let parser = parse_ok("x = 1\ny = 2");
        let code = global_code(&parser);
        assert_eq!(code[0].location.as_ref().unwrap().line_num, 1);
        assert_eq!(code[1].location.as_ref().unwrap().line_num, 2);
    }
}
