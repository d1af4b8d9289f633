//! Type & Schema Registry (C1): canonical data-type names, parsing,
//! widening/assignability rules.

use crate::types::DataType;

/// Parses the stable textual name used in persistence (§3) back into a
/// [`DataType`]. `List<T>` and `Struct<{...}>` are recursive; everything else
/// is a flat keyword.
pub fn parse_type(name: &str) -> Option<DataType> {
    let name = name.trim();
    Some(match name {
        "Int8" => DataType::Int8,
        "Int16" => DataType::Int16,
        "Int32" => DataType::Int32,
        "Int64" => DataType::Int64,
        "UInt8" => DataType::UInt8,
        "UInt16" => DataType::UInt16,
        "UInt32" => DataType::UInt32,
        "UInt64" => DataType::UInt64,
        "Float32" => DataType::Float32,
        "Float64" => DataType::Float64,
        "Boolean" => DataType::Boolean,
        "String" => DataType::String,
        "Binary" => DataType::Binary,
        "Date" => DataType::Date,
        "Time" => DataType::Time,
        "Datetime" => DataType::Datetime,
        "Duration" => DataType::Duration,
        "Null" => DataType::Null,
        "Unknown" => DataType::Unknown,
        _ if name.starts_with("List<") && name.ends_with('>') => {
            let inner = &name[5..name.len() - 1];
            DataType::List(Box::new(parse_type(inner)?))
        }
        _ if name.starts_with("Struct<{") && name.ends_with("}>") => {
            let inner = &name[8..name.len() - 2];
            let mut fields = Vec::new();
            for field in split_top_level(inner) {
                let (fname, ftype) = field.split_once(':')?;
                fields.push((fname.trim().to_string(), parse_type(ftype.trim())?));
            }
            DataType::Struct(fields)
        }
        _ => return None,
    })
}

/// The inverse of [`parse_type`]: a stable textual name for persistence and
/// error messages.
pub fn format_type(ty: &DataType) -> String {
    match ty {
        DataType::Int8 => "Int8".into(),
        DataType::Int16 => "Int16".into(),
        DataType::Int32 => "Int32".into(),
        DataType::Int64 => "Int64".into(),
        DataType::UInt8 => "UInt8".into(),
        DataType::UInt16 => "UInt16".into(),
        DataType::UInt32 => "UInt32".into(),
        DataType::UInt64 => "UInt64".into(),
        DataType::Float32 => "Float32".into(),
        DataType::Float64 => "Float64".into(),
        DataType::Boolean => "Boolean".into(),
        DataType::String => "String".into(),
        DataType::Binary => "Binary".into(),
        DataType::Date => "Date".into(),
        DataType::Time => "Time".into(),
        DataType::Datetime => "Datetime".into(),
        DataType::Duration => "Duration".into(),
        DataType::Null => "Null".into(),
        DataType::Unknown => "Unknown".into(),
        DataType::List(inner) => format!("List<{}>", format_type(inner)),
        DataType::Struct(fields) => {
            let inner = fields
                .iter()
                .map(|(n, t)| format!("{n}:{}", format_type(t)))
                .collect::<Vec<_>>()
                .join(",");
            format!("Struct<{{{inner}}}>")
        }
    }
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' | '{' => depth += 1,
            '>' | '}' => depth -= 1,
            ',' if depth == 0 => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

fn int_family(ty: &DataType) -> Option<(bool, u8)> {
    match ty {
        DataType::Int8 => Some((true, 8)),
        DataType::Int16 => Some((true, 16)),
        DataType::Int32 => Some((true, 32)),
        DataType::Int64 => Some((true, 64)),
        DataType::UInt8 => Some((false, 8)),
        DataType::UInt16 => Some((false, 16)),
        DataType::UInt32 => Some((false, 32)),
        DataType::UInt64 => Some((false, 64)),
        _ => None,
    }
}

/// Widening-rules assignability (§4.1): integers widen within their
/// signed/unsigned family; `Null` is assignable to any type (nullability is
/// tracked on the `Column`, not here); `String` is the universal fallback
/// target. Otherwise types must match exactly.
pub fn is_assignable(from: &DataType, to: &DataType) -> bool {
    if from == to {
        return true;
    }
    if matches!(from, DataType::Null) {
        return true;
    }
    if matches!(to, DataType::String) {
        return true;
    }
    if let (Some((signed_from, bits_from)), Some((signed_to, bits_to))) =
        (int_family(from), int_family(to))
    {
        return signed_from == signed_to && bits_from <= bits_to;
    }
    if matches!(from, DataType::Float32) && matches!(to, DataType::Float64) {
        return true;
    }
    if let (DataType::List(a), DataType::List(b)) = (from, to) {
        return is_assignable(a, b);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_flat_types() {
        for name in ["Int64", "Float32", "Boolean", "String", "Null", "Unknown"] {
            let ty = parse_type(name).expect("known type");
            assert_eq!(format_type(&ty), name);
        }
    }

    #[test]
    fn round_trips_nested_list_and_struct() {
        let ty = parse_type("List<Int64>").unwrap();
        assert_eq!(format_type(&ty), "List<Int64>");

        let ty = parse_type("Struct<{id:Int64,name:String}>").unwrap();
        assert_eq!(format_type(&ty), "Struct<{id:Int64,name:String}>");
    }

    #[test]
    fn unknown_name_fails_to_parse() {
        assert!(parse_type("Frobnicate").is_none());
    }

    #[test]
    fn int_widening_respects_family_and_sign() {
        assert!(is_assignable(&DataType::Int8, &DataType::Int64));
        assert!(!is_assignable(&DataType::Int64, &DataType::Int8));
        assert!(!is_assignable(&DataType::Int32, &DataType::UInt32));
    }

    #[test]
    fn null_and_string_fallback_rules() {
        assert!(is_assignable(&DataType::Null, &DataType::Boolean));
        assert!(is_assignable(&DataType::Int64, &DataType::String));
        assert!(!is_assignable(&DataType::String, &DataType::Int64));
    }
}
