//! Named device controls.
//!
//! Controls are addressed the way `v4l2-ctl` prints them: the driver's
//! name lower-cased with every run of other characters folded into `_`
//! ("White Balance Temperature, Auto" becomes
//! `white_balance_temperature_auto`).

use crate::error::{CameraError, Result};
use crate::traits::{ControlDescription, ControlKind, ControlValue};

/// Control id of the camera-class "focus, auto" toggle.
pub const FOCUS_AUTO: u32 = 0x009a_090c;

/// Fold a control name into its `v4l2-ctl` form.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Look up `name` among `controls` and check `value` against its type.
///
/// Returns the control id and the value to write.
pub fn resolve(
    controls: &[ControlDescription],
    name: &str,
    value: ControlValue,
) -> Result<(u32, ControlValue)> {
    let wanted = normalize_name(name);
    let control = controls
        .iter()
        .find(|control| normalize_name(&control.name) == wanted)
        .ok_or_else(|| CameraError::UnsupportedControl(name.to_owned()))?;

    let resolved = match (&control.kind, value) {
        (ControlKind::Boolean, value) => ControlValue::Boolean(as_bool(name, &value)?),
        (ControlKind::Integer, value) => {
            ControlValue::Integer(check_range(control, name, as_integer(name, &value)?)?)
        }
        (ControlKind::Menu(items), ControlValue::String(text)) => {
            let wanted = normalize_name(&text);
            let by_name = items
                .iter()
                .find(|(_, item)| normalize_name(item) == wanted)
                .map(|(index, _)| i64::from(*index));
            match by_name {
                Some(index) => ControlValue::Integer(index),
                None => ControlValue::Integer(menu_index(
                    items.iter().map(|(index, _)| *index),
                    name,
                    as_integer(name, &ControlValue::String(text))?,
                )?),
            }
        }
        (ControlKind::Menu(items), value) => ControlValue::Integer(menu_index(
            items.iter().map(|(index, _)| *index),
            name,
            as_integer(name, &value)?,
        )?),
        (ControlKind::IntegerMenu(items), value) => ControlValue::Integer(menu_index(
            items.iter().map(|(index, _)| *index),
            name,
            as_integer(name, &value)?,
        )?),
        (ControlKind::String, ControlValue::String(text)) => {
            let len = i64::try_from(text.len()).unwrap_or(i64::MAX);
            if len < control.minimum || len > control.maximum {
                return Err(CameraError::invalid_value(
                    name,
                    format!(
                        "length {len} outside {}..={}",
                        control.minimum, control.maximum
                    ),
                ));
            }
            ControlValue::String(text)
        }
        (ControlKind::String, _) => {
            return Err(CameraError::invalid_value(name, "expects a string"));
        }
        (ControlKind::Button, _) => ControlValue::Integer(1),
        (ControlKind::Other, _) => {
            return Err(CameraError::invalid_value(
                name,
                "control type cannot be written",
            ));
        }
    };

    Ok((control.id, resolved))
}

fn as_integer(name: &str, value: &ControlValue) -> Result<i64> {
    match value {
        ControlValue::Integer(value) => Ok(*value),
        ControlValue::Boolean(value) => Ok(i64::from(*value)),
        ControlValue::String(text) => text
            .trim()
            .parse()
            .map_err(|_| CameraError::invalid_value(name, format!("'{text}' is not an integer"))),
    }
}

fn as_bool(name: &str, value: &ControlValue) -> Result<bool> {
    match value {
        ControlValue::Boolean(value) => Ok(*value),
        ControlValue::Integer(0) => Ok(false),
        ControlValue::Integer(1) => Ok(true),
        ControlValue::Integer(other) => Err(CameraError::invalid_value(
            name,
            format!("{other} is not 0 or 1"),
        )),
        ControlValue::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            _ => Err(CameraError::invalid_value(
                name,
                format!("'{text}' is not a boolean"),
            )),
        },
    }
}

fn check_range(control: &ControlDescription, name: &str, value: i64) -> Result<i64> {
    if value < control.minimum || value > control.maximum {
        return Err(CameraError::invalid_value(
            name,
            format!(
                "{value} outside {}..={}",
                control.minimum, control.maximum
            ),
        ));
    }
    let step = i64::try_from(control.step).unwrap_or(1);
    if step > 1 && (value - control.minimum) % step != 0 {
        return Err(CameraError::invalid_value(
            name,
            format!("{value} is not a multiple of step {step} from {}", control.minimum),
        ));
    }
    Ok(value)
}

fn menu_index<I: IntoIterator<Item = u32>>(indices: I, name: &str, value: i64) -> Result<i64> {
    if indices.into_iter().any(|index| i64::from(index) == value) {
        Ok(value)
    } else {
        Err(CameraError::invalid_value(
            name,
            format!("{value} is not a menu entry"),
        ))
    }
}
