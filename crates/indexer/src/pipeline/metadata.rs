//! Metadata parsing and per-collection parser dispatch.
//!
//! Metadata in the wild comes in three common shapes:
//!
//! - attribute array: `{"attributes": [{"trait_type": "Fur", "value": "Solid Gold"}]}`
//! - property detail: `{"properties": {"Fur": {"value": "Solid Gold"}}}`
//! - property map: `{"properties": {"Fur": "Solid Gold"}}`
//!
//! The default parser tries them in that order. Collections can register
//! decorators that rewrite or add traits after the base parse.

use alloy::primitives::Address;
use nfttrack_core::Attribute;
use serde_json::Value;
use std::collections::HashMap;

/// Post-processing step applied after the base parse.
pub type Decorator = fn(&Value, &mut Vec<Attribute>);

/// Maps `(chain, contract)` to the decorators applied on top of the
/// default parser.
#[derive(Default)]
pub struct ParserRegistry {
    decorators: HashMap<(u64, Address), Vec<Decorator>>,
}

impl ParserRegistry {
    /// Empty registry; every collection gets the default parse.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decorator for one collection.
    pub fn register(&mut self, chain_id: u64, contract: Address, decorator: Decorator) {
        self.decorators
            .entry((chain_id, contract))
            .or_default()
            .push(decorator);
    }

    /// Parse raw metadata for a collection.
    pub fn parse(&self, chain_id: u64, contract: &Address, raw: &Value) -> Vec<Attribute> {
        let mut attributes = parse_default(raw);
        if let Some(decorators) = self.decorators.get(&(chain_id, *contract)) {
            for decorator in decorators {
                decorator(raw, &mut attributes);
            }
        }
        attributes
    }
}

/// Try the three common metadata shapes in order.
pub fn parse_default(raw: &Value) -> Vec<Attribute> {
    if let Some(attrs) = parse_attribute_array(raw) {
        return attrs;
    }
    if let Some(attrs) = parse_property_detail(raw) {
        return attrs;
    }
    parse_property_map(raw).unwrap_or_default()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_attribute_array(raw: &Value) -> Option<Vec<Attribute>> {
    let entries = raw.get("attributes")?.as_array()?;
    let attrs: Vec<Attribute> = entries
        .iter()
        .filter_map(|entry| {
            let trait_type = entry.get("trait_type")?.as_str()?;
            let value = scalar_to_string(entry.get("value")?)?;
            Some(Attribute::new(trait_type, value))
        })
        .collect();
    if attrs.is_empty() {
        None
    } else {
        Some(attrs)
    }
}

fn parse_property_detail(raw: &Value) -> Option<Vec<Attribute>> {
    let props = raw.get("properties")?.as_object()?;
    let attrs: Vec<Attribute> = props
        .iter()
        .filter_map(|(name, detail)| {
            let value = scalar_to_string(detail.get("value")?)?;
            Some(Attribute::new(name.clone(), value))
        })
        .collect();
    if attrs.is_empty() {
        None
    } else {
        Some(attrs)
    }
}

fn parse_property_map(raw: &Value) -> Option<Vec<Attribute>> {
    let props = raw.get("properties")?.as_object()?;
    let attrs: Vec<Attribute> = props
        .iter()
        .filter_map(|(name, value)| Some(Attribute::new(name.clone(), scalar_to_string(value)?)))
        .collect();
    if attrs.is_empty() {
        None
    } else {
        Some(attrs)
    }
}

/// Extract the image URL from metadata; some collections use
/// `image_url` instead of the standard `image`.
pub fn extract_image(raw: &Value) -> Option<String> {
    raw.get("image")
        .or_else(|| raw.get("image_url"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Extract the animation URL, when present.
pub fn extract_animation(raw: &Value) -> Option<String> {
    raw.get("animation_url")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decorator deriving a mutant-serum tier from the trait set: serum
/// mutants carry an explicit "Mega" trait value, everything else is M1/M2
/// by name suffix.
pub fn mutation_type_decorator(raw: &Value, attributes: &mut Vec<Attribute>) {
    let name = raw.get("name").and_then(Value::as_str).unwrap_or_default();
    let tier = if attributes.iter().any(|a| a.value.starts_with("Mega ")) {
        "M3"
    } else if name.contains("M2") {
        "M2"
    } else {
        "M1"
    };
    attributes.push(Attribute::new("Mutation Type", tier));
}

/// Decorator adding a Yes/No presence flag for a metadata key, e.g.
/// `"Koda?"` for Otherdeed plots with a linked Koda.
pub fn presence_flag(key: &'static str, label: &'static str) -> Decorator {
    // fn pointers cannot close over data, so the known flags are
    // enumerated here.
    match (key, label) {
        ("koda", "Koda?") => |raw: &Value, attributes: &mut Vec<Attribute>| {
            let present = raw.get("koda").map(|v| !v.is_null()).unwrap_or(false);
            attributes.push(Attribute::new(
                "Koda?",
                if present { "Yes" } else { "No" },
            ));
        },
        _ => |_: &Value, _: &mut Vec<Attribute>| {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use serde_json::json;

    #[test]
    fn parses_attribute_array_form() {
        let raw = json!({
            "name": "Ape #1",
            "attributes": [
                {"trait_type": "Fur", "value": "Solid Gold"},
                {"trait_type": "Hat", "value": 7},
            ]
        });
        let attrs = parse_default(&raw);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0], Attribute::new("Fur", "Solid Gold"));
        assert_eq!(attrs[1], Attribute::new("Hat", "7"));
    }

    #[test]
    fn falls_back_to_property_detail_then_map() {
        let detail = json!({"properties": {"Fur": {"value": "Robot"}}});
        assert_eq!(parse_default(&detail), vec![Attribute::new("Fur", "Robot")]);

        let map = json!({"properties": {"Fur": "Robot"}});
        assert_eq!(parse_default(&map), vec![Attribute::new("Fur", "Robot")]);

        assert!(parse_default(&json!({"name": "bare"})).is_empty());
    }

    #[test]
    fn registry_applies_decorators() {
        let contract = address!("60e4d786628fea6478f785a6d7e704777c86a7c6");
        let mut registry = ParserRegistry::new();
        registry.register(1, contract, mutation_type_decorator);

        let raw = json!({
            "name": "Mutant #42 M2",
            "attributes": [{"trait_type": "Fur", "value": "Zombie"}]
        });
        let attrs = registry.parse(1, &contract, &raw);
        assert!(attrs.contains(&Attribute::new("Mutation Type", "M2")));

        let mega = json!({
            "name": "Mutant #30007",
            "attributes": [{"trait_type": "Fur", "value": "Mega Swamp"}]
        });
        let attrs = registry.parse(1, &contract, &mega);
        assert!(attrs.contains(&Attribute::new("Mutation Type", "M3")));
    }

    #[test]
    fn koda_presence_flag() {
        let contract = address!("34d85c9cdeb23fa97cb08333b511ac86e1c4e258");
        let mut registry = ParserRegistry::new();
        registry.register(1, contract, presence_flag("koda", "Koda?"));

        let with = json!({"attributes": [{"trait_type": "Sediment", "value": "Biogenic Swamp"}], "koda": {"id": 3}});
        let attrs = registry.parse(1, &contract, &with);
        assert!(attrs.contains(&Attribute::new("Koda?", "Yes")));

        let without = json!({"attributes": [{"trait_type": "Sediment", "value": "Cosmic Dream"}]});
        let attrs = registry.parse(1, &contract, &without);
        assert!(attrs.contains(&Attribute::new("Koda?", "No")));
    }
}
