//! D-Bus value forms and their mapping to item values
//!
//! D-Bus has no null. BusItem services encode "no value" as an empty array
//! of int32 (`ai`); [`normalize`] turns that (and any other empty array)
//! into [`Value::Invalid`] and [`denormalize`] produces it for invalid
//! values.

use std::collections::BTreeMap;

use veitem::Value;

/// The D-Bus value forms used by BusItem services
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    /// `ai`, the invalid sentinel when empty
    IntArray(Vec<i32>),
    /// `av` or any other array
    Array(Vec<WireValue>),
    /// `a{sv}`
    Dict(BTreeMap<String, WireValue>),
    /// `v`
    Variant(Box<WireValue>),
}

/// Properties of one item as carried by `GetItems` and `ItemsChanged`
///
/// Keys are `Value`, `Text`, `Min`, `Max` and `Default`.
pub type PropertyMap = BTreeMap<String, WireValue>;

/// Item path to properties, the `a{sa{sv}}` payload
pub type ItemMap = BTreeMap<String, PropertyMap>;

impl WireValue {
    pub fn variant(inner: WireValue) -> Self {
        WireValue::Variant(Box::new(inner))
    }

    /// Strip any number of variant wrappers
    pub fn unwrap_variant(&self) -> &WireValue {
        let mut current = self;
        while let WireValue::Variant(inner) = current {
            current = inner;
        }
        current
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unwrap_variant() {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match normalize(self) {
            Value::Int(i) => Some(i),
            Value::Bool(b) => Some(i64::from(b)),
            _ => None,
        }
    }

    /// D-Bus type signature
    pub fn signature(&self) -> String {
        match self {
            WireValue::Bool(_) => "b".to_string(),
            WireValue::Byte(_) => "y".to_string(),
            WireValue::Int16(_) => "n".to_string(),
            WireValue::UInt16(_) => "q".to_string(),
            WireValue::Int32(_) => "i".to_string(),
            WireValue::UInt32(_) => "u".to_string(),
            WireValue::Int64(_) => "x".to_string(),
            WireValue::UInt64(_) => "t".to_string(),
            WireValue::Double(_) => "d".to_string(),
            WireValue::Str(_) => "s".to_string(),
            WireValue::IntArray(_) => "ai".to_string(),
            WireValue::Array(_) => "av".to_string(),
            WireValue::Dict(_) => "a{sv}".to_string(),
            WireValue::Variant(_) => "v".to_string(),
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Str(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::Str(s)
    }
}

impl From<i32> for WireValue {
    fn from(i: i32) -> Self {
        WireValue::Int32(i)
    }
}

/// Convert a received value to an item value
pub fn normalize(wire: &WireValue) -> Value {
    match wire {
        WireValue::Variant(inner) => normalize(inner),
        WireValue::Bool(b) => Value::Bool(*b),
        WireValue::Byte(v) => Value::Int(i64::from(*v)),
        WireValue::Int16(v) => Value::Int(i64::from(*v)),
        WireValue::UInt16(v) => Value::Int(i64::from(*v)),
        WireValue::Int32(v) => Value::Int(i64::from(*v)),
        WireValue::UInt32(v) => Value::Int(i64::from(*v)),
        WireValue::Int64(v) => Value::Int(*v),
        WireValue::UInt64(v) => match i64::try_from(*v) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Double(*v as f64),
        },
        WireValue::Double(v) => Value::Double(*v),
        WireValue::Str(s) => Value::String(s.clone()),
        WireValue::IntArray(items) if items.is_empty() => Value::Invalid,
        WireValue::IntArray(items) => {
            Value::List(items.iter().map(|i| Value::Int(i64::from(*i))).collect())
        }
        WireValue::Array(items) if items.is_empty() => Value::Invalid,
        WireValue::Array(items) => Value::List(items.iter().map(normalize).collect()),
        WireValue::Dict(map) => {
            Value::Map(map.iter().map(|(k, v)| (k.clone(), normalize(v))).collect())
        }
    }
}

/// Convert an item value to its wire form (without variant wrapper)
pub fn denormalize(value: &Value) -> WireValue {
    match value {
        Value::Invalid => WireValue::IntArray(Vec::new()),
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Int(i) => match i32::try_from(*i) {
            Ok(i) => WireValue::Int32(i),
            Err(_) => WireValue::Int64(*i),
        },
        Value::Double(d) => WireValue::Double(*d),
        Value::String(s) => WireValue::Str(s.clone()),
        Value::List(items) => WireValue::Array(items.iter().map(denormalize).map(WireValue::variant).collect()),
        Value::Map(map) => WireValue::Dict(
            map.iter()
                .map(|(k, v)| (k.clone(), WireValue::variant(denormalize(v))))
                .collect(),
        ),
    }
}

/// Read an `a{sa{sv}}` argument, ignoring malformed entries
pub fn item_map_from_wire(wire: &WireValue) -> Option<ItemMap> {
    let WireValue::Dict(entries) = wire.unwrap_variant() else {
        return None;
    };
    let mut items = ItemMap::new();
    for (path, properties) in entries {
        if let WireValue::Dict(properties) = properties.unwrap_variant() {
            items.insert(path.clone(), properties.clone());
        }
    }
    Some(items)
}

pub fn item_map_to_wire(items: &ItemMap) -> WireValue {
    WireValue::Dict(
        items
            .iter()
            .map(|(path, properties)| (path.clone(), WireValue::Dict(properties.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty_int_array(WireValue::IntArray(vec![]), Value::Invalid)]
    #[case::empty_array(WireValue::Array(vec![]), Value::Invalid)]
    #[case::nested_variant(WireValue::variant(WireValue::variant(WireValue::Int32(5))), Value::Int(5))]
    #[case::byte(WireValue::Byte(7), Value::Int(7))]
    #[case::huge_u64(WireValue::UInt64(u64::MAX), Value::Double(u64::MAX as f64))]
    #[case::string(WireValue::from("On"), Value::from("On"))]
    #[case::int_list(WireValue::IntArray(vec![1, 2]), Value::List(vec![Value::Int(1), Value::Int(2)]))]
    fn test_normalize(#[case] wire: WireValue, #[case] expected: Value) {
        assert_eq!(normalize(&wire), expected);
    }

    #[rstest]
    #[case::invalid(Value::Invalid, WireValue::IntArray(vec![]))]
    #[case::small_int(Value::Int(42), WireValue::Int32(42))]
    #[case::large_int(Value::Int(1 << 40), WireValue::Int64(1 << 40))]
    #[case::double(Value::Double(1.5), WireValue::Double(1.5))]
    fn test_denormalize(#[case] value: Value, #[case] expected: WireValue) {
        assert_eq!(denormalize(&value), expected);
    }

    #[test]
    fn test_dict_normalizes_recursively() {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), WireValue::variant(WireValue::IntArray(vec![])));
        dict.insert("b".to_string(), WireValue::variant(WireValue::Double(2.0)));
        let value = normalize(&WireValue::Dict(dict));
        let map = value.as_map().unwrap();
        assert_eq!(map.get("a"), Some(&Value::Invalid));
        assert_eq!(map.get("b"), Some(&Value::Double(2.0)));
    }

    #[test]
    fn test_item_map_skips_malformed_entries() {
        let mut soc = PropertyMap::new();
        soc.insert("Value".to_string(), WireValue::variant(WireValue::Double(55.0)));
        let mut entries = BTreeMap::new();
        entries.insert("/Soc".to_string(), WireValue::Dict(soc.clone()));
        entries.insert("/Broken".to_string(), WireValue::Int32(1));

        let items = item_map_from_wire(&WireValue::variant(WireValue::Dict(entries))).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items.get("/Soc"), Some(&soc));
        assert!(item_map_from_wire(&WireValue::Int32(1)).is_none());
    }

    #[test]
    fn test_signature() {
        assert_eq!(denormalize(&Value::Invalid).signature(), "ai");
        assert_eq!(WireValue::variant(WireValue::Int32(1)).signature(), "v");
    }
}
