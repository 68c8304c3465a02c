//! Property trees describing adapter state for debugger front ends

use std::borrow::Cow;
use std::fmt;

use crate::bus::Address;

#[macro_export]
macro_rules! dbgprop_header {
    ($name:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Header)
    };
}

#[macro_export]
macro_rules! dbgprop_bool {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Boolean($val))
    };
}

#[macro_export]
macro_rules! dbgprop_byte {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Byte($val))
    };
}

/// Guest physical address
#[macro_export]
macro_rules! dbgprop_addr {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Address($val))
    };
}

#[macro_export]
macro_rules! dbgprop_udec {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::UnsignedDecimal(($val) as u64))
    };
}

/// Enums deriving `strum::IntoStaticStr`
#[macro_export]
macro_rules! dbgprop_enum {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::StaticStr($val.clone().into()))
    };
}

#[macro_export]
macro_rules! dbgprop_string {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::String($val))
    };
}

#[macro_export]
macro_rules! dbgprop_str {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::StaticStr($val))
    };
}

/// Properties of a component that is itself `Debuggable`
#[macro_export]
macro_rules! dbgprop_nest {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new(
            $name,
            DebuggablePropertyValue::Nested($val.get_debug_properties()),
        )
    };
}

#[macro_export]
macro_rules! dbgprop_group {
    ($name:expr, $val:expr) => {
        DebuggableProperty::new($name, DebuggablePropertyValue::Nested($val))
    };
}

pub type DebuggableProperties = Vec<DebuggableProperty>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggableProperty {
    name: Cow<'static, str>,
    value: DebuggablePropertyValue,
}

impl DebuggableProperty {
    pub fn new(name: impl Into<Cow<'static, str>>, value: DebuggablePropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &DebuggablePropertyValue {
        &self.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggablePropertyValue {
    Header,
    Nested(DebuggableProperties),
    Boolean(bool),
    Byte(u8),
    Address(Address),
    UnsignedDecimal(u64),
    StaticStr(&'static str),
    String(String),
}

impl fmt::Display for DebuggablePropertyValue {
    /// Value column of a property list. Headers and groups have none.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header | Self::Nested(_) => Ok(()),
            Self::Boolean(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            Self::Byte(v) => write!(f, "${:02X}", v),
            Self::Address(a) => write!(f, "${:08X}", a),
            Self::UnsignedDecimal(v) => write!(f, "{}", v),
            Self::StaticStr(s) => f.write_str(s),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// Looks up a property by name, descending into nested groups for every
/// further path element
pub fn find_property<'a>(
    props: &'a [DebuggableProperty],
    path: &[&str],
) -> Option<&'a DebuggablePropertyValue> {
    let (first, rest) = path.split_first()?;
    let prop = props.iter().find(|p| p.name() == *first)?;
    if rest.is_empty() {
        return Some(prop.value());
    }
    match prop.value() {
        DebuggablePropertyValue::Nested(children) => find_property(children, rest),
        _ => None,
    }
}

pub trait Debuggable {
    fn get_debug_properties(&self) -> DebuggableProperties;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> DebuggableProperties {
        vec![
            dbgprop_header!("Registers"),
            dbgprop_byte!("Status", 0x10),
            dbgprop_group!(
                "Rings",
                vec![dbgprop_addr!("Out base", 0x1000), dbgprop_udec!("Count", 4u8)]
            ),
        ]
    }

    #[test]
    fn lookup_by_path() {
        let props = tree();
        assert_eq!(find_property(&props, &["Status"]), Some(&DebuggablePropertyValue::Byte(0x10)));
        assert_eq!(
            find_property(&props, &["Rings", "Count"]),
            Some(&DebuggablePropertyValue::UnsignedDecimal(4))
        );
        assert_eq!(find_property(&props, &["Rings", "In base"]), None);
        assert_eq!(find_property(&props, &["Status", "Count"]), None);
        assert_eq!(find_property(&props, &[]), None);
    }

    #[test]
    fn value_column() {
        let props = tree();
        let text: Vec<String> = props.iter().map(|p| p.value().to_string()).collect();
        assert_eq!(text, ["", "$10", ""]);
        assert_eq!(
            find_property(&props, &["Rings", "Out base"]).unwrap().to_string(),
            "$00001000"
        );
        assert_eq!(dbgprop_bool!("IRQ", true).value().to_string(), "yes");
    }
}
