use crate::{error::CoercionError, pool::ColumnValue};

/// Convert a column value to the float exported for it.
///
/// Integers, floats, timestamps (Unix seconds) and booleans always convert.
/// Text and bytes must parse as a decimal float. `NULL` and unmapped types
/// become `NaN` without an error.
///
/// # Errors
///
/// Returns [`CoercionError`] if text or bytes do not parse as a float.
#[allow(clippy::cast_precision_loss)]
pub fn to_f64(value: &ColumnValue) -> Result<f64, CoercionError> {
    match value {
        ColumnValue::Int(v) => Ok(*v as f64),
        ColumnValue::UInt(v) => Ok(*v as f64),
        ColumnValue::Float(v) => Ok(*v),
        ColumnValue::Timestamp(v) => Ok(v.timestamp() as f64),
        ColumnValue::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
        ColumnValue::Bytes(v) => parse(&String::from_utf8_lossy(v)),
        ColumnValue::Text(v) => parse(v),
        ColumnValue::Null | ColumnValue::Unsupported(_) => Ok(f64::NAN),
    }
}

fn parse(text: &str) -> Result<f64, CoercionError> {
    text.trim().parse::<f64>().map_err(|_| CoercionError {
        raw: text.to_string(),
    })
}
