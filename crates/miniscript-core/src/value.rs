use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use indexmap::{Equivalent, IndexMap};

/// Maximum number of characters in a string value.
pub const MAX_STRING_SIZE: usize = 0x00FF_FFFF;
/// Maximum number of elements in a list value.
pub const MAX_LIST_SIZE: usize = 0x00FF_FFFF;
/// Maximum depth of an `__isa` prototype chain.
pub const MAX_ISA_DEPTH: usize = 1000;
/// Default recursion depth for equality and hashing of containers.
pub const DEFAULT_EQUALITY_DEPTH: i32 = 16;
/// Maximum depth of the pending-argument stack in a call frame.
pub const MAX_ARG_STACK: usize = 256;

/// Magic map key that links a map to its prototype.
pub const ISA_KEY: &str = "__isa";

thread_local! {
    static EMPTY_STR: Rc<str> = Rc::from("");
}

pub type ListRc = Rc<RefCell<Vec<Value>>>;

/// The runtime value lattice.  `Var`, `Temp` and `SeqElem` are produced by
/// the parser and act as lvalues / deferred references at runtime; the
/// rest are ordinary data.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Number(f64),
    String(Rc<str>),
    List(ListRc),
    Map(Rc<ValMap>),
    Function(Rc<FuncValue>),
    Var { name: Rc<str>, no_invoke: bool },
    Temp(usize),
    SeqElem(Rc<SeqElem>),
}

/// A deferred indexed access (`seq[index]` or `seq.ident`), used both as
/// an lvalue and for dotted lookup through the prototype chain.
#[derive(Debug)]
pub struct SeqElem {
    pub sequence: Value,
    pub index: Value,
    pub no_invoke: bool,
}

/// A function paired with its captured lexical environment (if any).
#[derive(Debug)]
pub struct FuncValue {
    pub func: Rc<FuncDef>,
    pub outer_vars: Option<Rc<ValMap>>,
}

impl FuncValue {
    /// Produce a copy of this function value bound to the given variables
    /// map.  This is how closures come into being.
    pub fn bind_and_copy(&self, vars: Rc<ValMap>) -> Value {
        Value::Function(Rc::new(FuncValue {
            func: Rc::clone(&self.func),
            outer_vars: Some(vars),
        }))
    }
}

/// A function: parameters plus a block of TAC code.  Functions don't have
/// names; named functions are just variables whose value is a function.
#[derive(Debug)]
pub struct FuncDef {
    pub parameters: Vec<Param>,
    pub code: crate::tac::Code,
}

impl FuncDef {
    pub fn to_display(&self) -> String {
        let mut s = String::from("FUNCTION(");
        for (i, p) in self.parameters.iter().enumerate() {
            if i > 0 {
                s.push_str(", ");
            }
            s.push_str(&p.name);
            if !matches!(p.default_value, Value::Null) {
                s.push('=');
                s.push_str(&p.default_value.code_form(-1, None));
            }
        }
        s.push(')');
        s
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default_value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, default_value: Value) -> Self {
        Param {
            name: name.into(),
            default_value,
        }
    }
}

// ── Map keys ──────────────────────────────────────────────────────

/// Map key wrapper: hashes and compares through the value API so that key
/// equivalence matches language-level (fuzzy, depth-16) equality.
#[derive(Debug, Clone)]
pub struct MapKey(Value);

impl MapKey {
    pub fn new(value: Value) -> Self {
        MapKey(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl std::hash::Hash for MapKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_i32(self.0.hash());
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.equality(&other.0, DEFAULT_EQUALITY_DEPTH) == 1.0
    }
}

impl Eq for MapKey {}

/// Borrowed lookup key for an arbitrary value.
struct KeyRef<'a>(&'a Value);

impl std::hash::Hash for KeyRef<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_i32(self.0.hash());
    }
}

impl Equivalent<MapKey> for KeyRef<'_> {
    fn equivalent(&self, key: &MapKey) -> bool {
        self.0.equality(&key.0, DEFAULT_EQUALITY_DEPTH) == 1.0
    }
}

/// Borrowed lookup key for a string identifier, so identifier lookups
/// (which happen constantly) never allocate a string value.
struct StrKey<'a>(&'a str);

impl std::hash::Hash for StrKey<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_i32(string_hash(self.0));
    }
}

impl Equivalent<MapKey> for StrKey<'_> {
    fn equivalent(&self, key: &MapKey) -> bool {
        match &key.0 {
            Value::String(s) => &**s == self.0,
            _ => false,
        }
    }
}

// ── Maps ──────────────────────────────────────────────────────────

/// Assignment-override hook: return true to cancel the underlying store.
pub type AssignOverride = Box<dyn Fn(&Value, &Value) -> bool>;

/// A MiniScript map: insertion-ordered mapping from value to value, with
/// an optional prototype link through the `__isa` key and an optional
/// assignment-override hook.
pub struct ValMap {
    map: RefCell<IndexMap<MapKey, Value>>,
    pub assign_override: RefCell<Option<AssignOverride>>,
}

impl fmt::Debug for ValMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValMap({} entries)", self.count())
    }
}

impl Default for ValMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ValMap {
    pub fn new() -> Self {
        ValMap {
            map: RefCell::new(IndexMap::new()),
            assign_override: RefCell::new(None),
        }
    }

    pub fn new_rc() -> Rc<Self> {
        Rc::new(Self::new())
    }

    pub fn borrow(&self) -> Ref<'_, IndexMap<MapKey, Value>> {
        self.map.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, IndexMap<MapKey, Value>> {
        self.map.borrow_mut()
    }

    pub fn count(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    /// Raw lookup by arbitrary key; no `__isa` walk.
    pub fn get_raw(&self, key: &Value) -> Option<Value> {
        self.map.borrow().get(&KeyRef(key)).cloned()
    }

    /// Raw lookup by string key; no `__isa` walk.  Used for locals.
    pub fn get_raw_str(&self, identifier: &str) -> Option<Value> {
        self.map.borrow().get(&StrKey(identifier)).cloned()
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.map.borrow().contains_key(&KeyRef(key))
    }

    pub fn contains_str_key(&self, identifier: &str) -> bool {
        self.map.borrow().contains_key(&StrKey(identifier))
    }

    /// Put by string key, bypassing the assignment override.
    pub fn set(&self, identifier: &str, value: Value) {
        self.map
            .borrow_mut()
            .insert(MapKey(Value::string(identifier)), value);
    }

    /// Put by arbitrary key, bypassing the assignment override.
    pub fn insert(&self, key: Value, value: Value) {
        self.map.borrow_mut().insert(MapKey(key), value);
    }

    /// Remove by key (preserving the order of the remaining entries).
    /// Returns true if the key was present.
    pub fn remove(&self, key: &Value) -> bool {
        self.map.borrow_mut().shift_remove(&KeyRef(key)).is_some()
    }

    /// The map's prototype, if `__isa` is present and names a map.
    pub fn get_isa(&self) -> Option<Rc<ValMap>> {
        match self.get_raw_str(ISA_KEY) {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }

    /// Look up a key, walking the `__isa` chain as needed.
    pub fn lookup(&self, key: &Value) -> Option<Value> {
        if let Some(v) = self.get_raw(key) {
            return Some(v);
        }
        let mut next = self.get_isa();
        let mut loops_left = MAX_ISA_DEPTH;
        while let Some(m) = next {
            if let Some(v) = m.get_raw(key) {
                return Some(v);
            }
            if loops_left == 0 {
                break;
            }
            loops_left -= 1;
            next = m.get_isa();
        }
        None
    }

    /// Look up a string key, walking the `__isa` chain.
    pub fn get(&self, identifier: &str) -> Option<Value> {
        self.lookup(&Value::string(identifier))
    }

    /// Like `lookup`, but also returns the map the value was found in
    /// (which may be several steps up the chain).
    pub fn lookup_pair(start: &Rc<ValMap>, key: &Value) -> Option<(Value, Rc<ValMap>)> {
        let mut current = Rc::clone(start);
        let mut loops_left = MAX_ISA_DEPTH;
        loop {
            if let Some(v) = current.get_raw(key) {
                return Some((v, current));
            }
            match current.get_isa() {
                Some(next) if loops_left > 0 => {
                    loops_left -= 1;
                    current = next;
                }
                _ => return None,
            }
        }
    }

    /// Set an element, giving the assignment-override hook (if any) a
    /// chance to handle it instead.
    pub fn set_elem(&self, index: Value, value: Value) {
        let handled = match &*self.assign_override.borrow() {
            Some(hook) => hook(&index, &value),
            None => false,
        };
        if !handled {
            self.map.borrow_mut().insert(MapKey(index), value);
        }
    }

    pub fn keys(&self) -> Vec<Value> {
        self.map.borrow().keys().map(|k| k.0.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.map.borrow().values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.map
            .borrow()
            .iter()
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect()
    }

    /// The key/value pair at the given ordinal, as a two-key mini-map.
    /// This is what `for` iteration over a map produces.
    pub fn get_key_value_pair(&self, index: i64) -> Result<Value, crate::MiniscriptError> {
        let map = self.map.borrow();
        if index < 0 || index as usize >= map.len() {
            return Err(crate::MiniscriptError::index(format!(
                "index {index} out of range for map"
            )));
        }
        let (k, v) = map.get_index(index as usize).unwrap();
        let result = ValMap::new();
        result.set("key", k.0.clone());
        result.set("value", v.clone());
        Ok(Value::Map(Rc::new(result)))
    }

    /// Equality against another value, per the container rules.
    pub fn equality(&self, rhs: &Value, depth: i32) -> f64 {
        let rhm = match rhs {
            Value::Map(m) => m,
            _ => return 0.0,
        };
        if std::ptr::eq(self, Rc::as_ptr(rhm)) {
            return 1.0;
        }
        let lhs_map = self.map.borrow();
        let rhs_map = rhm.map.borrow();
        if lhs_map.len() != rhs_map.len() {
            return 0.0;
        }
        if depth < 1 {
            return 0.5;
        }
        let mut result = 1.0;
        for (k, v) in lhs_map.iter() {
            match rhs_map.get(k) {
                Some(rv) => {
                    result *= v.equality(rv, depth - 1);
                    if result <= 0.0 {
                        break;
                    }
                }
                None => return 0.0,
            }
        }
        result
    }
}

// ── Value constructors and accessors ──────────────────────────────

impl Value {
    /// Shared truth constants, matching number semantics.
    pub const ZERO: Value = Value::Number(0.0);
    pub const ONE: Value = Value::Number(1.0);

    pub fn truth(b: bool) -> Value {
        if b {
            Value::ONE
        } else {
            Value::ZERO
        }
    }

    /// Fuzzy truth: keeps intermediate values as they are.
    pub fn truth_value(v: f64) -> Value {
        Value::Number(v)
    }

    pub fn number(n: f64) -> Value {
        Value::Number(n)
    }

    /// Build a string value; empty input yields the canonical empty string.
    pub fn string(s: impl AsRef<str>) -> Value {
        let s = s.as_ref();
        if s.is_empty() {
            Value::empty_string()
        } else {
            Value::String(Rc::from(s))
        }
    }

    pub fn empty_string() -> Value {
        EMPTY_STR.with(|e| Value::String(Rc::clone(e)))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn map(map: Rc<ValMap>) -> Value {
        Value::Map(map)
    }

    pub fn new_map() -> Value {
        Value::Map(ValMap::new_rc())
    }

    pub fn var(name: impl AsRef<str>) -> Value {
        Value::Var {
            name: Rc::from(name.as_ref()),
            no_invoke: false,
        }
    }

    pub fn temp(num: usize) -> Value {
        Value::Temp(num)
    }

    pub fn seq_elem(sequence: Value, index: Value) -> Value {
        Value::SeqElem(Rc::new(SeqElem {
            sequence,
            index,
            no_invoke: false,
        }))
    }

    pub fn function(func: Rc<FuncDef>) -> Value {
        Value::Function(Rc::new(FuncValue {
            func,
            outer_vars: None,
        }))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListRc> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Rc<ValMap>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<FuncValue>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Friendly type name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Var { .. } => "variable",
            Value::Temp(_) => "temporary",
            Value::SeqElem(_) => "sequence element",
        }
    }

    // ── Numeric conversions ───────────────────────────────────────

    pub fn double_value(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            _ => 0.0,
        }
    }

    pub fn int_value(&self) -> i64 {
        self.double_value() as i64
    }

    /// Truth value: nonzero numbers, nonempty strings, nonempty
    /// containers, and all functions are true.
    pub fn bool_value(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Function(_) => true,
            _ => self.int_value() != 0,
        }
    }

    // ── Equality and hashing ──────────────────────────────────────

    /// Fuzzy equality in [0, 1]: 1 means equal, 0 unequal, and 0.5 when
    /// the recursion depth runs out before we can be sure.
    pub fn equality(&self, rhs: &Value, depth: i32) -> f64 {
        match (self, rhs) {
            (Value::Null, Value::Null) => 1.0,
            (Value::Number(a), Value::Number(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::String(a), Value::String(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return 1.0;
                }
                let av = a.borrow();
                let bv = b.borrow();
                if av.len() != bv.len() {
                    return 0.0;
                }
                if depth < 1 {
                    return 0.5;
                }
                let mut result = 1.0;
                for (x, y) in av.iter().zip(bv.iter()) {
                    result *= x.equality(y, depth - 1);
                    if result <= 0.0 {
                        break;
                    }
                }
                result
            }
            (Value::Map(a), _) => a.equality(rhs, depth),
            (Value::Function(a), Value::Function(b)) => {
                if Rc::ptr_eq(&a.func, &b.func) {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::Var { name: a, .. }, Value::Var { name: b, .. }) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::Temp(a), Value::Temp(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::SeqElem(a), Value::SeqElem(b)) => {
                if Rc::ptr_eq(a, b) {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    pub fn hash(&self) -> i32 {
        self.hash_depth(DEFAULT_EQUALITY_DEPTH)
    }

    /// Hash agreeing with `equality`: values equal at sufficient depth
    /// hash alike.
    pub fn hash_depth(&self, depth: i32) -> i32 {
        match self {
            Value::Null => -1,
            Value::Number(n) => {
                let bits = n.to_bits();
                (bits ^ (bits >> 32)) as i32
            }
            Value::String(s) => string_hash(s),
            Value::List(l) => {
                let values = l.borrow();
                let mut result = values.len() as i32;
                if depth < 1 {
                    return result;
                }
                for v in values.iter() {
                    result ^= v.hash_depth(depth - 1);
                }
                result
            }
            Value::Map(m) => {
                let map = m.borrow();
                let mut result = map.len() as i32;
                if depth < 0 {
                    return result;
                }
                for (k, v) in map.iter() {
                    result ^= k.value().hash_depth(depth - 1);
                    result ^= v.hash_depth(depth - 1);
                }
                result
            }
            Value::Function(f) => Rc::as_ptr(&f.func) as i32,
            Value::Var { name, .. } => string_hash(name),
            Value::Temp(n) => *n as i32,
            Value::SeqElem(se) => {
                se.sequence.hash_depth(depth - 1) ^ se.index.hash_depth(depth - 1)
            }
        }
    }

    // ── Printing ──────────────────────────────────────────────────

    /// Plain display form: strings unquoted, containers at recursion
    /// limit 3, numbers in MiniScript format.
    pub fn to_display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) => s.to_string(),
            Value::List(_) | Value::Map(_) => self.code_form(3, None),
            Value::Function(f) => f.func.to_display(),
            other => other.code_form(-1, None),
        }
    }

    /// MiniScript-literal form.  `recursion_limit` of -1 means no limit;
    /// at 0 containers render as `[...]` / `{...}`.  At limits 1 and 2 a
    /// short-name finder (typically the machine's global-variable scan)
    /// may substitute a name for a container.
    pub fn code_form(&self, recursion_limit: i32, finder: Option<&dyn Fn(&Value) -> Option<String>>) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::String(s) => format!("\"{}\"", s.replace('"', "\"\"")),
            Value::List(l) => {
                if recursion_limit == 0 {
                    return "[...]".to_string();
                }
                if (1..3).contains(&recursion_limit) {
                    if let Some(f) = finder {
                        if let Some(name) = f(self) {
                            return name;
                        }
                    }
                }
                let values = l.borrow();
                let parts: Vec<String> = values
                    .iter()
                    .map(|v| v.code_form(recursion_limit - 1, finder))
                    .collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Map(m) => {
                if recursion_limit == 0 {
                    return "{...}".to_string();
                }
                if (1..3).contains(&recursion_limit) {
                    if let Some(f) = finder {
                        if let Some(name) = f(self) {
                            return name;
                        }
                    }
                }
                let entries = m.entries();
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| {
                        let next_limit = if k.as_string() == Some(ISA_KEY) {
                            1
                        } else {
                            recursion_limit - 1
                        };
                        format!(
                            "{}: {}",
                            k.code_form(next_limit, finder),
                            v.code_form(next_limit, finder)
                        )
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Function(f) => f.func.to_display(),
            Value::Var { name, no_invoke } => {
                if *no_invoke {
                    format!("@{name}")
                } else {
                    name.to_string()
                }
            }
            Value::Temp(n) => format!("_{n}"),
            Value::SeqElem(se) => format!(
                "{}{}[{}]",
                if se.no_invoke { "@" } else { "" },
                se.sequence.code_form(recursion_limit, finder),
                se.index.code_form(recursion_limit, finder)
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display())
    }
}

// ── Supporting functions ──────────────────────────────────────────

/// Deterministic, content-based string hash (so equal strings agree
/// across runs and across map instances).
pub fn string_hash(s: &str) -> i32 {
    let mut h: i32 = 0;
    for c in s.chars() {
        h = h.wrapping_mul(31).wrapping_add(c as i32);
    }
    h
}

/// Format a number the MiniScript way: integer form when the fractional
/// part is zero, scientific notation outside [1e-6, 1e10], and otherwise
/// the shortest decimal form that round-trips.
pub fn number_to_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if value % 1.0 == 0.0 {
        if value.abs() <= 1e10 {
            format!("{value:.0}")
        } else {
            scientific(value)
        }
    } else if value.abs() > 1e10 || value.abs() < 1e-6 {
        scientific(value)
    } else {
        format!("{value}")
    }
}

fn scientific(value: f64) -> String {
    let s = format!("{value:E}");
    match s.find('E') {
        Some(pos) if s.as_bytes().get(pos + 1) != Some(&b'-') => {
            format!("{}E+{}", &s[..pos], &s[pos + 1..])
        }
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_equality_is_one() {
        let values = [
            Value::Null,
            Value::Number(42.0),
            Value::string("hello"),
            Value::list(vec![Value::Number(1.0), Value::string("x")]),
            Value::new_map(),
        ];
        for v in &values {
            assert_eq!(v.equality(v, DEFAULT_EQUALITY_DEPTH), 1.0, "{v}");
        }
    }

    #[test]
    fn string_equality_is_content_based() {
        assert_eq!(Value::string("abc").equality(&Value::string("abc"), 16), 1.0);
        assert_eq!(Value::string("abc").equality(&Value::string("abd"), 16), 0.0);
        assert_eq!(Value::string("abc").equality(&Value::string("ABC"), 16), 0.0);
    }

    #[test]
    fn cross_type_equality_is_zero() {
        assert_eq!(Value::Number(0.0).equality(&Value::string("0"), 16), 0.0);
        assert_eq!(Value::Null.equality(&Value::Number(0.0), 16), 0.0);
        assert_eq!(Value::string("").equality(&Value::Null, 16), 0.0);
    }

    #[test]
    fn list_equality_recurses_and_runs_out_of_depth() {
        let a = Value::list(vec![Value::list(vec![Value::Number(1.0)])]);
        let b = Value::list(vec![Value::list(vec![Value::Number(1.0)])]);
        assert_eq!(a.equality(&b, 16), 1.0);
        // depth exhausted before elements can be compared
        assert_eq!(a.equality(&b, 0), 0.5);
    }

    #[test]
    fn equality_is_commutative() {
        let cases = [
            (Value::Number(3.0), Value::Number(3.0)),
            (Value::string("a"), Value::string("b")),
            (Value::Null, Value::Number(1.0)),
            (
                Value::list(vec![Value::Number(1.0)]),
                Value::list(vec![Value::Number(1.0)]),
            ),
        ];
        for (a, b) in &cases {
            assert_eq!(a.equality(b, 16), b.equality(a, 16));
        }
    }

    #[test]
    fn hash_agrees_with_equality() {
        let a = Value::list(vec![Value::Number(1.0), Value::string("x")]);
        let b = Value::list(vec![Value::Number(1.0), Value::string("x")]);
        assert_eq!(a.equality(&b, 16), 1.0);
        assert_eq!(a.hash(), b.hash());

        let m1 = ValMap::new_rc();
        m1.set("k", Value::Number(7.0));
        let m2 = ValMap::new_rc();
        m2.set("k", Value::Number(7.0));
        assert_eq!(Value::Map(m1.clone()).equality(&Value::Map(m2.clone()), 16), 1.0);
        assert_eq!(Value::Map(m1).hash(), Value::Map(m2).hash());
    }

    #[test]
    fn null_hash_is_minus_one() {
        assert_eq!(Value::Null.hash(), -1);
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.bool_value());
        assert!(Value::Number(0.5).bool_value());
        assert!(!Value::Number(0.0).bool_value());
        assert!(!Value::string("").bool_value());
        assert!(Value::string("x").bool_value());
        assert!(!Value::list(vec![]).bool_value());
        assert!(Value::list(vec![Value::Null]).bool_value());
        let m = ValMap::new_rc();
        assert!(!Value::Map(m.clone()).bool_value());
        m.set("a", Value::ONE);
        assert!(Value::Map(m).bool_value());
    }

    #[test]
    fn empty_string_is_canonical() {
        let a = Value::string("");
        let b = Value::empty_string();
        match (&a, &b) {
            (Value::String(x), Value::String(y)) => assert!(Rc::ptr_eq(x, y)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(42.0), "42");
        assert_eq!(number_to_string(-3.0), "-3");
        assert_eq!(number_to_string(42.5), "42.5");
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(1e11), "1E+11");
        assert_eq!(number_to_string(1e-7), "1E-7");
        assert_eq!(number_to_string(0.001), "0.001");
    }

    #[test]
    fn number_string_round_trips() {
        for x in [42.0, -3.25, 0.1, 1.0 / 3.0, 1e-7, 2.5e11, 123456.789] {
            let s = number_to_string(x);
            let back: f64 = s.parse().unwrap();
            assert_eq!(back, x, "{s}");
        }
    }

    #[test]
    fn code_form_quotes_strings() {
        assert_eq!(Value::string("hi \"there\"").code_form(-1, None), "\"hi \"\"there\"\"\"");
        let l = Value::list(vec![Value::string("a"), Value::Number(2.0)]);
        assert_eq!(l.code_form(3, None), "[\"a\", 2]");
    }

    #[test]
    fn map_preserves_insertion_order() {
        let m = ValMap::new_rc();
        m.set("one", Value::Number(1.0));
        m.set("two", Value::Number(2.0));
        m.set("three", Value::Number(3.0));
        let keys: Vec<String> = m
            .keys()
            .iter()
            .map(|k| k.as_string().unwrap().to_string())
            .collect();
        assert_eq!(keys, ["one", "two", "three"]);
    }

    #[test]
    fn map_lookup_walks_isa_chain() {
        let parent = ValMap::new_rc();
        parent.set("greet", Value::string("hello"));
        let child = ValMap::new_rc();
        child.set(ISA_KEY, Value::Map(Rc::clone(&parent)));
        assert_eq!(
            child.get("greet").unwrap().as_string().unwrap(),
            "hello"
        );
        let (found, found_in) =
            ValMap::lookup_pair(&child, &Value::string("greet")).unwrap();
        assert_eq!(found.as_string().unwrap(), "hello");
        assert!(Rc::ptr_eq(&found_in, &parent));
    }

    #[test]
    fn map_keys_use_value_equality() {
        let m = ValMap::new_rc();
        m.insert(Value::list(vec![Value::Number(1.0)]), Value::string("x"));
        // A distinct but equal list reaches the same slot.
        assert!(m.contains_key(&Value::list(vec![Value::Number(1.0)])));
        assert!(!m.contains_key(&Value::list(vec![Value::Number(2.0)])));
    }

    #[test]
    fn assign_override_can_cancel_store() {
        let m = ValMap::new();
        *m.assign_override.borrow_mut() = Some(Box::new(|key, _value| {
            key.as_string() == Some("readonly")
        }));
        m.set_elem(Value::string("readonly"), Value::Number(1.0));
        m.set_elem(Value::string("ok"), Value::Number(2.0));
        assert!(!m.contains_str_key("readonly"));
        assert!(m.contains_str_key("ok"));
    }
}
