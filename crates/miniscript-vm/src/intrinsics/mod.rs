use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use miniscript_core::{
    new_code, FuncDef, FuncValue, Line, MiniscriptError, Op, Param, ValMap, Value,
};

use crate::context::Context;
use crate::machine::same_identity;

mod stdlib;

/// The result of one intrinsic invocation.  When `done` is false, the
/// machine stays on the same TAC line and re-invokes the intrinsic next
/// step, handing back `value` as in-progress state.
#[derive(Debug, Clone)]
pub struct IntrinsicResult {
    pub done: bool,
    pub value: Value,
}

impl IntrinsicResult {
    /// Canonical results, shared by intrinsics that produce them a lot.
    pub const NULL: IntrinsicResult = IntrinsicResult {
        done: true,
        value: Value::Null,
    };
    pub const TRUE: IntrinsicResult = IntrinsicResult {
        done: true,
        value: Value::ONE,
    };
    pub const FALSE: IntrinsicResult = IntrinsicResult {
        done: true,
        value: Value::ZERO,
    };
    /// Waiting: not done, with no in-progress state.
    pub const WAITING: IntrinsicResult = IntrinsicResult {
        done: false,
        value: Value::Null,
    };

    pub fn new(value: Value) -> Self {
        IntrinsicResult { done: true, value }
    }

    /// A partial result: not done, with in-progress state.
    pub fn partial(value: Value) -> Self {
        IntrinsicResult { done: false, value }
    }

    pub fn num(n: f64) -> Self {
        IntrinsicResult::new(Value::Number(n))
    }

    pub fn string(s: impl AsRef<str>) -> Self {
        IntrinsicResult::new(Value::string(s))
    }

    pub fn null() -> Self {
        IntrinsicResult::new(Value::Null)
    }

    pub fn truth(b: bool) -> Self {
        IntrinsicResult::new(Value::truth(b))
    }

    pub fn empty_string() -> Self {
        IntrinsicResult::new(Value::empty_string())
    }
}

pub type IntrinsicFn =
    Rc<dyn Fn(&mut Context, Option<IntrinsicResult>) -> Result<IntrinsicResult, MiniscriptError>>;

/// A built-in function, registered by name and dispatched by numeric id.
/// Each intrinsic carries a one-line wrapper function whose only job is
/// to provide a local variable context for the parameters.
pub struct Intrinsic {
    pub name: String,
    id: usize,
    func: Rc<FuncDef>,
    code: IntrinsicFn,
}

impl Intrinsic {
    pub fn id(&self) -> usize {
        self.id
    }

    /// The wrapper function value the compiler and `get_var` hand out.
    pub fn get_func(&self) -> Value {
        Value::Function(Rc::new(FuncValue {
            func: Rc::clone(&self.func),
            outer_vars: None,
        }))
    }

    /// Start defining a new intrinsic.  Finish with
    /// [`IntrinsicBuilder::code`], which registers it.
    pub fn create(name: impl Into<String>) -> IntrinsicBuilder {
        IntrinsicBuilder {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn get_by_name(name: &str) -> Option<Rc<Intrinsic>> {
        init_if_needed();
        REGISTRY.with(|r| {
            let registry = r.borrow();
            registry
                .by_name
                .get(name)
                .map(|&id| Rc::clone(&registry.all[id]))
        })
    }

    pub fn get_by_id(id: usize) -> Option<Rc<Intrinsic>> {
        REGISTRY.with(|r| r.borrow().all.get(id).map(Rc::clone))
    }

    /// Execute an intrinsic by id, with the partial result from the
    /// previous invocation (if any).
    pub fn execute(
        id: usize,
        context: &mut Context,
        partial: Option<IntrinsicResult>,
    ) -> Result<IntrinsicResult, MiniscriptError> {
        let code = REGISTRY
            .with(|r| r.borrow().all.get(id).map(|i| Rc::clone(&i.code)))
            .ok_or_else(|| MiniscriptError::runtime(format!("invalid intrinsic id {id}")))?;
        code(context, partial)
    }
}

pub struct IntrinsicBuilder {
    name: String,
    params: Vec<Param>,
}

impl IntrinsicBuilder {
    /// Add a parameter with no default.  Parameters must be added in the
    /// order arguments are supplied.
    pub fn add_param(mut self, name: &str) -> Self {
        self.params.push(Param::new(name, Value::Null));
        self
    }

    pub fn add_param_num(mut self, name: &str, default: f64) -> Self {
        self.params.push(Param::new(name, Value::Number(default)));
        self
    }

    pub fn add_param_str(mut self, name: &str, default: &str) -> Self {
        self.params.push(Param::new(name, Value::string(default)));
        self
    }

    /// Attach the native code and register the intrinsic.
    pub fn code(
        self,
        f: impl Fn(&mut Context, Option<IntrinsicResult>) -> Result<IntrinsicResult, MiniscriptError>
            + 'static,
    ) {
        REGISTRY.with(|r| {
            let mut registry = r.borrow_mut();
            let id = registry.all.len();
            // The wrapper is a single opcode: CallIntrinsicA.
            let code = new_code();
            code.borrow_mut().push(Line::new(
                Value::temp(0),
                Op::CallIntrinsicA,
                Value::Number(id as f64),
                Value::Null,
            ));
            let func = Rc::new(FuncDef {
                parameters: self.params,
                code,
            });
            let intrinsic = Rc::new(Intrinsic {
                name: self.name.clone(),
                id,
                func,
                code: Rc::new(f),
            });
            registry.by_name.insert(self.name, id);
            registry.all.push(intrinsic);
        });
    }
}

// ── Registry ──────────────────────────────────────────────────────

struct Registry {
    all: Vec<Rc<Intrinsic>>,
    by_name: HashMap<String, usize>,
    short_names: Vec<(Value, String)>,
    initialized: bool,
    function_type: Option<Rc<ValMap>>,
    list_type: Option<Rc<ValMap>>,
    map_type: Option<Rc<ValMap>>,
    number_type: Option<Rc<ValMap>>,
    string_type: Option<Rc<ValMap>>,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry {
        all: Vec::new(),
        by_name: HashMap::new(),
        short_names: Vec::new(),
        initialized: false,
        function_type: None,
        list_type: None,
        map_type: None,
        number_type: None,
        string_type: None,
    });
}

fn init_if_needed() {
    let needs_init = REGISTRY.with(|r| {
        let mut registry = r.borrow_mut();
        if registry.initialized {
            false
        } else {
            registry.initialized = true;
            true
        }
    });
    if needs_init {
        stdlib::init();
    }
}

/// Register a display name for a value (typically a type map), used by
/// the machine's reverse name lookup when printing.
pub fn add_short_name(value: Value, name: impl Into<String>) {
    REGISTRY.with(|r| r.borrow_mut().short_names.push((value, name.into())));
}

pub fn lookup_short_name(value: &Value) -> Option<String> {
    REGISTRY.with(|r| {
        r.borrow()
            .short_names
            .iter()
            .find(|(v, _)| same_identity(v, value))
            .map(|(_, name)| name.clone())
    })
}

// ── Built-in type prototype maps ──────────────────────────────────

fn intrinsic_func(name: &str) -> Value {
    Intrinsic::get_by_name(name)
        .unwrap_or_else(|| panic!("built-in intrinsic '{name}' not registered"))
        .get_func()
}

fn type_map(
    slot: impl Fn(&mut Registry) -> &mut Option<Rc<ValMap>>,
    short_name: &str,
    members: &[&str],
) -> Rc<ValMap> {
    init_if_needed();
    if let Some(m) = REGISTRY.with(|r| slot(&mut r.borrow_mut()).clone()) {
        return m;
    }
    let map = ValMap::new_rc();
    for member in members {
        map.set(member, intrinsic_func(member));
    }
    REGISTRY.with(|r| {
        let mut registry = r.borrow_mut();
        *slot(&mut registry) = Some(Rc::clone(&map));
        registry
            .short_names
            .push((Value::Map(Rc::clone(&map)), short_name.to_string()));
    });
    map
}

/// The static map representing the Function type.
pub fn function_type() -> Rc<ValMap> {
    type_map(|r| &mut r.function_type, "funcRef", &[])
}

/// The static map representing the List type, carrying the intrinsic
/// methods reachable on any list via dot syntax.
pub fn list_type() -> Rc<ValMap> {
    type_map(
        |r| &mut r.list_type,
        "list",
        &[
            "hasIndex", "indexes", "indexOf", "insert", "join", "len", "pop", "pull", "push",
            "shuffle", "sort", "sum", "remove", "replace", "values",
        ],
    )
}

/// The static map representing the String type.
pub fn string_type() -> Rc<ValMap> {
    type_map(
        |r| &mut r.string_type,
        "string",
        &[
            "hasIndex", "indexes", "indexOf", "insert", "code", "len", "lower", "val", "remove",
            "replace", "split", "upper", "values",
        ],
    )
}

/// The static map representing the Map type.
pub fn map_type() -> Rc<ValMap> {
    type_map(
        |r| &mut r.map_type,
        "map",
        &[
            "hasIndex", "indexes", "indexOf", "len", "pop", "push", "pull", "shuffle", "sum",
            "remove", "replace", "values",
        ],
    )
}

/// The static map representing the Number type.
pub fn number_type() -> Rc<ValMap> {
    type_map(|r| &mut r.number_type, "number", &[])
}

// ── Host info ─────────────────────────────────────────────────────

/// Information about the app hosting MiniScript, surfaced through the
/// `version` intrinsic.  Set this from your main program.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub name: String,
    pub info: String,
    pub version: f64,
}

thread_local! {
    static HOST_INFO: RefCell<HostInfo> = RefCell::new(HostInfo {
        name: "Unknown".to_string(),
        info: String::new(),
        version: 0.0,
    });
}

pub fn set_host_info(name: impl Into<String>, info: impl Into<String>, version: f64) {
    HOST_INFO.with(|h| {
        *h.borrow_mut() = HostInfo {
            name: name.into(),
            info: info.into(),
            version,
        };
    });
}

pub fn host_info() -> HostInfo {
    HOST_INFO.with(|h| h.borrow().clone())
}

// ── Compiler support ──────────────────────────────────────────────

/// Emit the TAC for a slice expression (`seq[from:to]`) as a call to the
/// `slice` intrinsic.  A missing `from` means 0; a missing `to` stays
/// null (slice to the end).
pub fn compile_slice(
    code: &mut Vec<Line>,
    list: Value,
    from_idx: Value,
    to_idx: Value,
    result_temp: usize,
) {
    code.push(Line::unary(Value::Null, Op::PushParam, list));
    let from = if from_idx.is_null() {
        Value::ZERO
    } else {
        from_idx
    };
    code.push(Line::unary(Value::Null, Op::PushParam, from));
    code.push(Line::unary(Value::Null, Op::PushParam, to_idx));
    code.push(Line::new(
        Value::temp(result_temp),
        Op::CallFunctionA,
        intrinsic_func("slice"),
        Value::Number(3.0),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intrinsics_resolve_by_name_and_id() {
        let sqrt = Intrinsic::get_by_name("sqrt").unwrap();
        let again = Intrinsic::get_by_id(sqrt.id()).unwrap();
        assert_eq!(again.name, "sqrt");
        assert!(Intrinsic::get_by_name("no_such_intrinsic").is_none());
    }

    #[test]
    fn wrapper_functions_are_stable() {
        let a = Intrinsic::get_by_name("len").unwrap().get_func();
        let b = Intrinsic::get_by_name("len").unwrap().get_func();
        // same underlying function: equal by function identity
        assert_eq!(a.equality(&b, 16), 1.0);
    }

    #[test]
    fn type_maps_carry_methods() {
        assert!(list_type().get("sort").unwrap().as_function().is_some());
        assert!(string_type().get("split").unwrap().as_function().is_some());
        assert!(map_type().get("hasIndex").unwrap().as_function().is_some());
        assert!(number_type().is_empty());
    }

    #[test]
    fn type_maps_have_short_names() {
        let lt = Value::Map(list_type());
        assert_eq!(lookup_short_name(&lt).unwrap(), "list");
    }
}
