//! Execution context for submitted scene code.
//!
//! One mutable namespace lives for the whole session, seeded with handles
//! to the host objects (`window`, `scene`, `view`). Each submission runs
//! against that namespace, so agents can build state up across fragments.
//! Stdout produced by the code (`print`) goes into a per-call capture sink;
//! failures are rendered as readable text in the outcome and never abort
//! the context itself.

use {
    crate::{
        dsl::{self, BinOp, Expr, Stmt, Target, UnOp},
        scene::SceneManager,
    },
    serde_json::{Map, Value as Json, json},
    std::{collections::BTreeMap, sync::Arc},
};

/// A cell in the namespace.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(Vec<(String, Value)>),
    Handle(Handle),
    Module(String),
}

/// An opaque reference to a host-side object: a seeded host singleton, a
/// registered scene item, or a created widget.
#[derive(Clone, Debug, PartialEq)]
pub struct Handle {
    pub type_name: String,
    pub id: u64,
    pub widget: bool,
}

impl Value {
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format!("{v:?}"),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Dict(pairs) => {
                let inner: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("'{k}': {}", v.repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Handle(h) => format!("<{} object>", h.type_name),
            Value::Module(name) => format!("<module '{name}'>"),
        }
    }

    /// `str()`-style rendering: strings lose their quotes, everything else
    /// reads like its repr.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(pairs) => !pairs.is_empty(),
            Value::Handle(_) | Value::Module(_) => true,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Handle(h) => &h.type_name,
            Value::Module(_) => "module",
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    /// JSON form for primitives and containers of primitives; `None` for
    /// handles and modules.
    pub fn to_json(&self) -> Option<Json> {
        match self {
            Value::None => Some(Json::Null),
            Value::Bool(b) => Some(json!(b)),
            Value::Int(v) => Some(json!(v)),
            Value::Float(v) => Some(json!(v)),
            Value::Str(s) => Some(json!(s)),
            Value::List(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Option<Vec<_>>>()
                .map(Json::Array),
            Value::Dict(pairs) => {
                let mut map = Map::new();
                for (k, v) in pairs {
                    map.insert(k.clone(), v.to_json()?);
                }
                Some(Json::Object(map))
            }
            Value::Handle(_) | Value::Module(_) => None,
        }
    }

    pub fn from_json(value: &Json) -> Value {
        match value {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Captured standard streams of one execution.
#[derive(Default)]
pub struct Capture {
    pub out: Vec<u8>,
    pub err: Vec<u8>,
}

/// What one submission did.
pub struct ExecOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub widgets_created: Vec<String>,
    pub items_registered: Vec<String>,
}

pub struct ExecCtx {
    namespace: BTreeMap<String, Value>,
    scene: Arc<SceneManager>,
    next_obj: u64,
}

const ITEM_KINDS: &[(&str, &str, &[&str])] = &[
    ("rect", "Rect", &["x", "y", "w", "h"]),
    ("ellipse", "Ellipse", &["x", "y", "w", "h"]),
    ("line", "Line", &["x1", "y1", "x2", "y2"]),
    ("text", "Text", &["x", "y", "text"]),
];

const WIDGET_KINDS: &[(&str, &str)] = &[("label", "Label"), ("button", "Button")];

/// Whether `name` is a constructor whose only effect is creating a widget.
/// Context compaction uses this to spot statements it may elide.
pub fn is_widget_constructor(name: &str) -> bool {
    WIDGET_KINDS.iter().any(|(f, _)| *f == name)
}

impl ExecCtx {
    pub fn new(scene: Arc<SceneManager>) -> ExecCtx {
        let mut namespace = BTreeMap::new();
        for (name, type_name) in [
            ("window", "MainWindow"),
            ("scene", "Scene"),
            ("view", "GraphicsView"),
        ] {
            namespace.insert(
                name.to_string(),
                Value::Handle(Handle {
                    type_name: type_name.to_string(),
                    id: 0,
                    widget: false,
                }),
            );
        }
        ExecCtx {
            namespace,
            scene,
            next_obj: 1,
        }
    }

    /// Run one submission. The namespace keeps whatever bindings were made
    /// before a failing statement; a failure never poisons later runs.
    pub fn run(&mut self, code: &str) -> (ExecOutcome, Capture) {
        let mut capture = Capture::default();
        let mut outcome = ExecOutcome {
            success: true,
            error: None,
            result: None,
            widgets_created: Vec::new(),
            items_registered: Vec::new(),
        };

        let stmts = match dsl::parse_program(code) {
            Ok(stmts) => stmts,
            Err(e) => {
                outcome.success = false;
                outcome.error = Some(format!("SyntaxError: {e}"));
                return (outcome, capture);
            }
        };

        let last = stmts.len().saturating_sub(1);
        for (i, stmt) in stmts.iter().enumerate() {
            match self.exec_stmt(stmt, &mut capture, &mut outcome) {
                Ok(value) => {
                    if i == last {
                        outcome.result = match stmt {
                            Stmt::Expr(_) => Some(value),
                            _ => None,
                        };
                    }
                }
                Err(e) => {
                    outcome.success = false;
                    outcome.error = Some(e);
                    outcome.result = None;
                    break;
                }
            }
        }
        (outcome, capture)
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        capture: &mut Capture,
        outcome: &mut ExecOutcome,
    ) -> Result<Value, String> {
        match stmt {
            Stmt::Import { module, bindings } => {
                for binding in bindings {
                    self.namespace
                        .insert(binding.clone(), Value::Module(module.clone()));
                }
                Ok(Value::None)
            }
            Stmt::Assign { name, expr } => {
                let value = self.eval(expr, capture, outcome)?;
                self.namespace.insert(name.clone(), value);
                Ok(Value::None)
            }
            Stmt::Del { name } => match self.namespace.remove(name) {
                Some(_) => Ok(Value::None),
                None => Err(format!("NameError: name '{name}' is not defined")),
            },
            Stmt::Expr(expr) => self.eval(expr, capture, outcome),
        }
    }

    fn eval(
        &mut self,
        expr: &Expr,
        capture: &mut Capture,
        outcome: &mut ExecOutcome,
    ) -> Result<Value, String> {
        match expr {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => self
                .namespace
                .get(name)
                .cloned()
                .ok_or_else(|| format!("NameError: name '{name}' is not defined")),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, capture, outcome)?);
                }
                Ok(Value::List(out))
            }
            Expr::Dict(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = match self.eval(k, capture, outcome)? {
                        Value::Str(s) => s,
                        Value::Int(i) => i.to_string(),
                        other => {
                            return Err(format!(
                                "TypeError: unhashable dict key of type '{}'",
                                other.type_name()
                            ));
                        }
                    };
                    out.push((key, self.eval(v, capture, outcome)?));
                }
                Ok(Value::Dict(out))
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand, capture, outcome)?;
                match (op, v) {
                    (UnOp::Neg, Value::Int(v)) => Ok(Value::Int(-v)),
                    (UnOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
                    (UnOp::Not, v) => Ok(Value::Bool(!v.truthy())),
                    (UnOp::Neg, v) => Err(format!(
                        "TypeError: bad operand type for unary -: '{}'",
                        v.type_name()
                    )),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs, capture, outcome)?;
                let r = self.eval(rhs, capture, outcome)?;
                binary_op(*op, l, r)
            }
            Expr::Call {
                target,
                args,
                kwargs,
            } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for a in args {
                    arg_values.push(self.eval(a, capture, outcome)?);
                }
                let mut kw_values = Vec::with_capacity(kwargs.len());
                for (k, v) in kwargs {
                    kw_values.push((k.clone(), self.eval(v, capture, outcome)?));
                }
                match target {
                    Target::Function(name) => {
                        self.call_function(name, arg_values, kw_values, capture, outcome)
                    }
                    Target::Method { object, method } => {
                        self.call_method(object, method, arg_values, kw_values)
                    }
                }
            }
        }
    }

    fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        capture: &mut Capture,
        outcome: &mut ExecOutcome,
    ) -> Result<Value, String> {
        match name {
            "print" => {
                let line: Vec<String> = args.iter().map(Value::display).collect();
                capture.out.extend_from_slice(line.join(" ").as_bytes());
                capture.out.push(b'\n');
                Ok(Value::None)
            }
            "len" => match args.as_slice() {
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                [Value::List(items)] => Ok(Value::Int(items.len() as i64)),
                [Value::Dict(pairs)] => Ok(Value::Int(pairs.len() as i64)),
                [other] => Err(format!(
                    "TypeError: object of type '{}' has no len()",
                    other.type_name()
                )),
                _ => Err("TypeError: len() takes exactly one argument".to_string()),
            },
            "repr" => match args.as_slice() {
                [v] => Ok(Value::Str(v.repr())),
                _ => Err("TypeError: repr() takes exactly one argument".to_string()),
            },
            "str" => match args.as_slice() {
                [v] => Ok(Value::Str(v.display())),
                [] => Ok(Value::Str(String::new())),
                _ => Err("TypeError: str() takes at most one argument".to_string()),
            },
            "int" => match args.as_slice() {
                [Value::Int(v)] => Ok(Value::Int(*v)),
                [Value::Float(v)] => Ok(Value::Int(*v as i64)),
                [Value::Bool(b)] => Ok(Value::Int(*b as i64)),
                [Value::Str(s)] => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| format!("ValueError: invalid literal for int(): '{s}'")),
                _ => Err("TypeError: int() argument must be a number or string".to_string()),
            },
            "float" => match args.as_slice() {
                [Value::Int(v)] => Ok(Value::Float(*v as f64)),
                [Value::Float(v)] => Ok(Value::Float(*v)),
                [Value::Str(s)] => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| format!("ValueError: could not convert string to float: '{s}'")),
                _ => Err("TypeError: float() argument must be a number or string".to_string()),
            },
            _ => {
                if let Some((kind, type_name, prop_names)) =
                    ITEM_KINDS.iter().find(|(f, _, _)| *f == name)
                {
                    return self.construct_item(kind, type_name, prop_names, args, kwargs, outcome);
                }
                if let Some((kind, type_name)) = WIDGET_KINDS.iter().find(|(f, _)| *f == name) {
                    let id = self.next_obj;
                    self.next_obj += 1;
                    outcome.widgets_created.push(format!("{kind}#{id}"));
                    return Ok(Value::Handle(Handle {
                        type_name: type_name.to_string(),
                        id,
                        widget: true,
                    }));
                }
                Err(format!("NameError: name '{name}' is not defined"))
            }
        }
    }

    fn construct_item(
        &mut self,
        kind: &str,
        type_name: &str,
        prop_names: &[&str],
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        outcome: &mut ExecOutcome,
    ) -> Result<Value, String> {
        if args.len() > prop_names.len() {
            return Err(format!(
                "TypeError: {kind}() takes at most {} positional arguments",
                prop_names.len()
            ));
        }
        let mut props = Map::new();
        for (name, value) in prop_names.iter().zip(args.iter()) {
            props.insert(
                name.to_string(),
                value
                    .to_json()
                    .ok_or_else(|| format!("TypeError: {kind}() argument '{name}' is opaque"))?,
            );
        }
        for (name, value) in &kwargs {
            props.insert(
                name.clone(),
                value
                    .to_json()
                    .ok_or_else(|| format!("TypeError: {kind}() argument '{name}' is opaque"))?,
            );
        }
        let item = self.scene.register_item(kind, props);
        outcome.items_registered.push(format!("{kind}#{}", item.id));
        Ok(Value::Handle(Handle {
            type_name: type_name.to_string(),
            id: item.id,
            widget: false,
        }))
    }

    fn call_method(
        &mut self,
        object: &str,
        method: &str,
        args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
    ) -> Result<Value, String> {
        let handle = match self.namespace.get(object) {
            Some(Value::Handle(h)) => h.clone(),
            Some(other) => {
                return Err(format!(
                    "AttributeError: '{}' object has no method '{method}'",
                    other.type_name()
                ));
            }
            None => return Err(format!("NameError: name '{object}' is not defined")),
        };

        match (handle.type_name.as_str(), method) {
            ("Scene", "clear") => {
                self.scene.clear();
                Ok(Value::None)
            }
            ("Scene", "refresh") | ("GraphicsView", "refresh") => {
                self.scene.refresh();
                Ok(Value::None)
            }
            ("Scene", "count") => Ok(Value::Int(self.scene.item_count() as i64)),
            ("MainWindow", "resize") => match args.as_slice() {
                [Value::Int(w), Value::Int(h)] if *w > 0 && *h > 0 => {
                    self.scene.set_size(*w as u32, *h as u32);
                    Ok(Value::None)
                }
                _ => Err("TypeError: resize() takes two positive integers".to_string()),
            },
            ("MainWindow", "background") => match args.as_slice() {
                [Value::Str(color)] => {
                    self.scene.set_background(color);
                    Ok(Value::None)
                }
                _ => Err("TypeError: background() takes a color string".to_string()),
            },
            _ => Err(format!(
                "AttributeError: '{}' object has no method '{method}'",
                handle.type_name
            )),
        }
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.namespace.contains_key(name)
    }

    pub fn binding_names(&self) -> Vec<String> {
        self.namespace.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.namespace.insert(name.to_string(), value);
    }

    /// The `vars` view: primitives and plain containers verbatim, opaque
    /// values as `<TypeName object>`. Underscore names and modules are
    /// omitted.
    pub fn namespace_json(&self) -> Json {
        let mut map = Map::new();
        for (name, value) in &self.namespace {
            if name.starts_with('_') || matches!(value, Value::Module(_)) {
                continue;
            }
            let rendered = value
                .to_json()
                .unwrap_or_else(|| json!(format!("<{} object>", value.type_name())));
            map.insert(name.clone(), rendered);
        }
        Json::Object(map)
    }

    /// Primitive bindings only, for the `state` envelope.
    pub fn primitive_vars(&self) -> Map<String, Json> {
        let mut map = Map::new();
        for (name, value) in &self.namespace {
            if name.starts_with('_') || !value.is_primitive() {
                continue;
            }
            if let Some(j) = value.to_json() {
                map.insert(name.clone(), j);
            }
        }
        map
    }
}

fn binary_op(op: BinOp, l: Value, r: Value) -> Result<Value, String> {
    use BinOp::*;
    let type_err = |l: &Value, r: &Value| {
        format!(
            "TypeError: unsupported operand type(s) for {op}: '{}' and '{}'",
            l.type_name(),
            r.type_name()
        )
    };

    match op {
        Eq => return Ok(Value::Bool(value_eq(&l, &r))),
        Ne => return Ok(Value::Bool(!value_eq(&l, &r))),
        Lt | Le | Gt | Ge => {
            let ord = match (&l, &r) {
                (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                _ => match (as_f64(&l), as_f64(&r)) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ord) = ord else {
                return Err(type_err(&l, &r));
            };
            let result = match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                Ge => ord.is_ge(),
                _ => unreachable!(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, &l, &r) {
        (Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
        (Add, Value::List(a), Value::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(Value::List(out));
        }
        (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
            return Ok(Value::Str(s.repeat((*n).max(0) as usize)));
        }
        _ => {}
    }

    match (&l, &r) {
        (Value::Int(a), Value::Int(b)) => match op {
            Add => Ok(Value::Int(a + b)),
            Sub => Ok(Value::Int(a - b)),
            Mul => Ok(Value::Int(a * b)),
            Mod if *b != 0 => {
                // Floored modulo: the result takes the divisor's sign.
                let m = a % b;
                Ok(Value::Int(if m != 0 && (m < 0) != (*b < 0) {
                    m + b
                } else {
                    m
                }))
            }
            Mod => Err("ZeroDivisionError: integer modulo by zero".to_string()),
            Div if *b != 0 => Ok(Value::Float(*a as f64 / *b as f64)),
            Div => Err("ZeroDivisionError: division by zero".to_string()),
            _ => unreachable!(),
        },
        _ => match (as_f64(&l), as_f64(&r)) {
            (Some(a), Some(b)) => match op {
                Add => Ok(Value::Float(a + b)),
                Sub => Ok(Value::Float(a - b)),
                Mul => Ok(Value::Float(a * b)),
                Div if b != 0.0 => Ok(Value::Float(a / b)),
                Div => Err("ZeroDivisionError: float division by zero".to_string()),
                Mod if b != 0.0 => {
                    let m = a % b;
                    Ok(Value::Float(if m != 0.0 && (m < 0.0) != (b < 0.0) {
                        m + b
                    } else {
                        m
                    }))
                }
                Mod => Err("ZeroDivisionError: float modulo".to_string()),
                _ => unreachable!(),
            },
            _ => Err(type_err(&l, &r)),
        },
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    }
}

fn value_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Int(_) | Value::Float(_) | Value::Bool(_), Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
            as_f64(l) == as_f64(r)
        }
        _ => l == r,
    }
}
