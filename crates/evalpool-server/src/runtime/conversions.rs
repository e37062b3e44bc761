//! Export of script values to JSON.
//!
//! A completed script hands back a Boa `JsValue`; callers receive a
//! `serde_json::Value`. Only values with a faithful JSON form are exported.
//!
//! # Type Mapping
//!
//! | JavaScript | JSON |
//! |------------|------|
//! | `undefined`, `null` | `null` |
//! | Boolean | boolean |
//! | finite Number | number (integral values become integers) |
//! | String | string |
//! | Array | array |
//! | Object | object (string keys only) |
//!
//! Functions, symbols, bigints, `NaN`/`Infinity`, and structures nested deeper
//! than [`MAX_EXPORT_DEPTH`] (which includes every cyclic structure) are
//! export errors. So is any value holding more than [`MAX_EXPORT_ITEMS`]
//! array elements and object members in total; sparse arrays count their
//! full length. Array holes and `undefined` elements become `null`;
//! `undefined` object members are omitted as `JSON.stringify` does.

use boa_engine::{
    object::{builtins::JsArray, JsObject},
    property::PropertyKey,
    value::JsValue,
    Context,
};
use evalpool_common::protocol::error::{EvalError, Result};
use serde_json::{Map, Number, Value as JsonValue};

/// Maximum nesting of arrays and objects in an exported value.
pub const MAX_EXPORT_DEPTH: usize = 64;

/// Maximum number of array elements plus object members in an exported
/// value, summed over every nesting level.
pub const MAX_EXPORT_ITEMS: usize = 100_000;

/// Largest integer that survives the f64 round trip exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Converts a script value into JSON.
///
/// # Errors
///
/// Returns `EvalError::Conversion` for values without a JSON form, or
/// `EvalError::Script` if a property getter throws while the value is read.
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    let mut budget = MAX_EXPORT_ITEMS;
    export(value, ctx, 0, &mut budget)
}

fn export(
    value: &JsValue,
    ctx: &mut Context,
    depth: usize,
    budget: &mut usize,
) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(i) = value.as_i32() {
        return Ok(JsonValue::Number(i.into()));
    }

    if let Some(n) = value.as_number() {
        return number_to_json(n);
    }

    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    if value.is_symbol() {
        return Err(EvalError::Conversion("symbols cannot be exported".into()));
    }

    if value.is_bigint() {
        return Err(EvalError::Conversion("bigints cannot be exported".into()));
    }

    let Some(obj) = value.as_object() else {
        return Err(EvalError::Conversion("unsupported value type".into()));
    };
    let obj: JsObject = obj.clone();

    if obj.is_callable() {
        return Err(EvalError::Conversion("functions cannot be exported".into()));
    }

    if depth >= MAX_EXPORT_DEPTH {
        return Err(EvalError::Conversion(format!(
            "value nested deeper than {} levels (cyclic structure?)",
            MAX_EXPORT_DEPTH
        )));
    }

    if obj.is_array() {
        return export_array(obj, ctx, depth, budget);
    }

    export_object(&obj, ctx, depth, budget)
}

fn number_to_json(n: f64) -> Result<JsonValue> {
    if !n.is_finite() {
        return Err(EvalError::Conversion(format!("non-finite number {}", n)));
    }

    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Ok(JsonValue::Number((n as i64).into()));
    }

    Number::from_f64(n)
        .map(JsonValue::Number)
        .ok_or_else(|| EvalError::Conversion(format!("number {} has no JSON form", n)))
}

/// Charges `count` items against the remaining export budget.
fn take_items(budget: &mut usize, count: usize) -> Result<()> {
    *budget = budget.checked_sub(count).ok_or_else(|| {
        EvalError::Conversion(format!(
            "value holds more than {} elements",
            MAX_EXPORT_ITEMS
        ))
    })?;
    Ok(())
}

fn export_array(
    obj: JsObject,
    ctx: &mut Context,
    depth: usize,
    budget: &mut usize,
) -> Result<JsonValue> {
    let array = JsArray::from_object(obj)
        .map_err(|e| EvalError::Conversion(format!("invalid array: {}", e)))?;

    let length: usize = array
        .length(ctx)
        .map_err(script_error)?
        .try_into()
        .map_err(|_| EvalError::Conversion("array length overflow".into()))?;
    take_items(budget, length)?;

    let mut items = Vec::with_capacity(length.min(1024));
    for index in 0..length {
        let element = array.get(index, ctx).map_err(script_error)?;
        items.push(export(&element, ctx, depth + 1, budget)?);
    }
    Ok(JsonValue::Array(items))
}

fn export_object(
    obj: &JsObject,
    ctx: &mut Context,
    depth: usize,
    budget: &mut usize,
) -> Result<JsonValue> {
    let keys = obj.own_property_keys(ctx).map_err(script_error)?;
    take_items(budget, keys.len())?;

    let mut map = Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };

        let member = obj.get(key.clone(), ctx).map_err(script_error)?;
        if member.is_undefined() {
            continue;
        }
        map.insert(name, export(&member, ctx, depth + 1, budget)?);
    }
    Ok(JsonValue::Object(map))
}

fn script_error(err: boa_engine::JsError) -> EvalError {
    EvalError::Script(err.to_string())
}
