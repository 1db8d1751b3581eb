use std::fmt;
use std::rc::Rc;

use serde_json::Value;

/// Evaluation context handed to deferred formulas.
///
/// A formula may read any other key of the stack it is evaluated against,
/// so the full stack (not a single container) is the context.
pub trait SettingsView {
    /// Raw lookup: first container (top to bottom) that defines `key`.
    fn raw_setting(&self, key: &str) -> Option<SettingValue>;

    /// Resolve `key`, evaluating a formula against this view if needed.
    fn resolve(&self, key: &str) -> Option<Value>
    where
        Self: Sized,
    {
        resolve_key(self, key)
    }
}

// Formulas hold a `&dyn SettingsView` and resolve through it, so the
// lookup must also be callable on the trait object itself.
impl dyn SettingsView + '_ {
    pub fn resolve(&self, key: &str) -> Option<Value> {
        resolve_key(self, key)
    }
}

fn resolve_key(view: &dyn SettingsView, key: &str) -> Option<Value> {
    match view.raw_setting(key)? {
        SettingValue::Literal(v) => Some(v),
        SettingValue::Formula(f) => Some(f.evaluate(view)),
    }
}

/// A deferred formula: a value computed from the whole stack on read.
#[derive(Clone)]
pub struct SettingFormula(Rc<dyn Fn(&dyn SettingsView) -> Value>);

impl SettingFormula {
    pub fn new(f: impl Fn(&dyn SettingsView) -> Value + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn evaluate(&self, view: &dyn SettingsView) -> Value {
        (self.0)(view)
    }
}

impl fmt::Debug for SettingFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SettingFormula(..)")
    }
}

/// One setting entry in a container: a plain value, or a formula that needs
/// the full stack to evaluate.
#[derive(Clone, Debug)]
pub enum SettingValue {
    Literal(Value),
    Formula(SettingFormula),
}

impl SettingValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        SettingValue::Literal(value.into())
    }

    pub fn formula(f: impl Fn(&dyn SettingsView) -> Value + 'static) -> Self {
        SettingValue::Formula(SettingFormula::new(f))
    }
}

impl From<Value> for SettingValue {
    fn from(value: Value) -> Self {
        SettingValue::Literal(value)
    }
}

/// Interpret a resolved value as an extruder index, tolerating the integer
/// and stringified-integer encodings both found in project files.
pub fn as_extruder_index(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
