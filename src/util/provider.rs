//! Helpers for implementing `figment::Provider`
// (c) 2024 Ross Younger

use figment::value::{Dict, Value};

/// Helper function for `figment::Provider` implementation
///
/// If the given `arg` is not None, inserts it into `dict` with key `arg_name`.
pub fn insert_if_some<T>(
    dict: &mut Dict,
    arg_name: &str,
    arg: Option<T>,
) -> Result<(), figment::Error>
where
    T: serde::Serialize,
{
    if let Some(a) = arg {
        let _ = dict.insert(arg_name.to_string(), Value::serialize(a)?);
    }
    Ok(())
}
